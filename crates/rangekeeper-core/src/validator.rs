//! Command validator — three ordered layers between raw text and the engine
//!
//! Layer 1 checks the leading tool against a whitelist, layer 2 scans the
//! full string against a dangerous-pattern blocklist (a hard veto, not
//! overridable by layer 1), layer 3 applies per-tool parameter checks.
//! The validator is pure and stateless; rule contents are configuration.

use std::collections::HashMap;
use std::net::IpAddr;

use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

/// Machine-readable rejection class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    UnknownTool,
    BlockedPattern,
    BadParameter,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::UnknownTool => "unknown_tool",
            Self::BlockedPattern => "blocked_pattern",
            Self::BadParameter => "bad_parameter",
        };
        f.write_str(s)
    }
}

/// Category a whitelisted tool belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCategory {
    Recon,
    Exploitation,
    Web,
    Password,
    Sniffing,
}

/// A whitelisted tool and its optional mandatory subcommands.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolRule {
    pub name: String,
    pub category: ToolCategory,
    /// When non-empty, the first argument must be one of these.
    #[serde(default)]
    pub subcommands: Vec<String>,
}

/// A named regex rule (blocklist or breakout signature).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternRule {
    pub name: String,
    pub pattern: String,
}

/// The curated rule lists. Defaults cover the common training-sandbox
/// toolchain; deployments override or extend them from the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleSet {
    #[serde(default = "default_tools")]
    pub tools: Vec<ToolRule>,
    #[serde(default = "default_blocklist")]
    pub blocklist: Vec<PatternRule>,
    /// Container-escape signatures, consumed by the security monitor.
    /// Distinct from the blocklist: a match implies intent, not malformed
    /// input.
    #[serde(default = "default_breakout")]
    pub breakout: Vec<PatternRule>,
    /// CIDRs commands are allowed to target.
    #[serde(default = "default_target_networks")]
    pub target_networks: Vec<String>,
}

impl Default for RuleSet {
    fn default() -> Self {
        Self {
            tools: default_tools(),
            blocklist: default_blocklist(),
            breakout: default_breakout(),
            target_networks: default_target_networks(),
        }
    }
}

fn tool(name: &str, category: ToolCategory) -> ToolRule {
    ToolRule {
        name: name.to_string(),
        category,
        subcommands: Vec::new(),
    }
}

fn default_tools() -> Vec<ToolRule> {
    use ToolCategory::*;
    let mut tools = vec![
        tool("nmap", Recon),
        tool("masscan", Recon),
        tool("ping", Recon),
        tool("traceroute", Recon),
        tool("dig", Recon),
        tool("host", Recon),
        tool("whois", Recon),
        tool("arp-scan", Recon),
        tool("netdiscover", Recon),
        tool("enum4linux", Recon),
        tool("msfconsole", Exploitation),
        tool("msfvenom", Exploitation),
        tool("searchsploit", Exploitation),
        tool("sqlmap", Exploitation),
        tool("nc", Exploitation),
        tool("nikto", Web),
        tool("dirb", Web),
        tool("whatweb", Web),
        tool("wpscan", Web),
        tool("curl", Web),
        tool("wget", Web),
        tool("hydra", Password),
        tool("john", Password),
        tool("hashcat", Password),
        tool("medusa", Password),
        tool("crunch", Password),
        tool("cewl", Password),
        tool("tcpdump", Sniffing),
        tool("tshark", Sniffing),
        tool("ettercap", Sniffing),
    ];
    tools.push(ToolRule {
        name: "gobuster".to_string(),
        category: Web,
        subcommands: vec![
            "dir".to_string(),
            "dns".to_string(),
            "vhost".to_string(),
            "fuzz".to_string(),
        ],
    });
    tools
}

fn pattern(name: &str, regex: &str) -> PatternRule {
    PatternRule {
        name: name.to_string(),
        pattern: regex.to_string(),
    }
}

fn default_blocklist() -> Vec<PatternRule> {
    vec![
        pattern("destructive_rm", r"\brm\s+-[a-zA-Z-]*[rf]"),
        pattern("raw_disk_write", r"\bdd\b"),
        pattern("setuid_chmod", r"chmod\s+(u\+s|\+s|[0-7]?[4-7][0-7]{3})"),
        pattern("filesystem_format", r"\bmkfs"),
        pattern("shell_chaining", r"[;&|]"),
        pattern("command_substitution", r"`|\$\("),
        pattern("io_redirection", r"[<>]"),
        pattern("path_traversal", r"\.\./"),
        pattern(
            "raw_device_access",
            r"/dev/(sd[a-z]|hd[a-z]|nvme|mem|kmem|port|loop)",
        ),
    ]
}

fn default_breakout() -> Vec<PatternRule> {
    vec![
        pattern("docker_socket", r"docker\.sock"),
        pattern("docker_cli", r"\bdocker\s+(run|exec|cp|build|commit|ps)"),
        pattern("nsenter", r"\bnsenter\b"),
        pattern("namespace_unshare", r"\bunshare\b"),
        pattern("suid_discovery", r"-perm\s+(-|/)?(4000|u=s)"),
        pattern("proc_kernel_access", r"/proc/(kcore|kmem|1/|sys/kernel)"),
        pattern("cgroup_escape", r"release_agent|/sys/fs/cgroup"),
        pattern("kernel_module", r"\b(insmod|modprobe)\b"),
        pattern("privileged_mount", r"\bmount\b"),
    ]
}

fn default_target_networks() -> Vec<String> {
    vec![
        "172.25.0.0/16".to_string(),
        "10.100.0.0/16".to_string(),
        "127.0.0.0/8".to_string(),
    ]
}

/// A command parsed once by the validator and threaded through the monitor
/// and the gateway, so nothing downstream re-parses the raw string.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParsedCommand {
    pub tool: String,
    pub category: ToolCategory,
    pub args: Vec<String>,
}

impl ParsedCommand {
    /// Full argv, tool first.
    pub fn argv(&self) -> Vec<String> {
        let mut argv = Vec::with_capacity(self.args.len() + 1);
        argv.push(self.tool.clone());
        argv.extend(self.args.iter().cloned());
        argv
    }
}

/// Outcome of validation: allow plus the parsed command, or a rejection
/// carrying the matched rule and a machine-readable reason.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationVerdict {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched_rule: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<RejectReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<ParsedCommand>,
}

impl ValidationVerdict {
    pub fn allow(rule: impl Into<String>, command: ParsedCommand) -> Self {
        Self {
            allowed: true,
            matched_rule: Some(rule.into()),
            reason: None,
            detail: None,
            command: Some(command),
        }
    }

    pub fn reject(
        reason: RejectReason,
        rule: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            allowed: false,
            matched_rule: Some(rule.into()),
            reason: Some(reason),
            detail: Some(detail.into()),
            command: None,
        }
    }
}

/// Caller context, used for log attribution only.
#[derive(Debug, Clone, Default)]
pub struct ValidationContext {
    pub user_id: String,
    pub session_id: Option<String>,
}

struct CompiledPattern {
    name: String,
    regex: regex::Regex,
}

fn compile_patterns(rules: &[PatternRule]) -> Vec<CompiledPattern> {
    rules
        .iter()
        .filter_map(|rule| match regex::Regex::new(&rule.pattern) {
            Ok(regex) => Some(CompiledPattern {
                name: rule.name.clone(),
                regex,
            }),
            Err(e) => {
                warn!("Failed to compile pattern '{}': {}", rule.name, e);
                None
            }
        })
        .collect()
}

/// The stateless three-layer validator.
pub struct CommandValidator {
    tools: HashMap<String, ToolRule>,
    blocklist: Vec<CompiledPattern>,
    target_networks: Vec<IpNetwork>,
}

impl CommandValidator {
    pub fn new(rules: &RuleSet) -> Self {
        let tools = rules
            .tools
            .iter()
            .map(|t| (t.name.to_lowercase(), t.clone()))
            .collect();
        let target_networks = rules
            .target_networks
            .iter()
            .filter_map(|cidr| match cidr.parse::<IpNetwork>() {
                Ok(net) => Some(net),
                Err(e) => {
                    warn!("Invalid target network '{}': {}", cidr, e);
                    None
                }
            })
            .collect();
        Self {
            tools,
            blocklist: compile_patterns(&rules.blocklist),
            target_networks,
        }
    }

    /// Validate a raw command through all three layers, short-circuiting on
    /// the first rejection.
    pub fn validate(&self, raw: &str, ctx: &ValidationContext) -> ValidationVerdict {
        let tokens: Vec<&str> = raw.split_whitespace().collect();
        let Some(first) = tokens.first() else {
            return ValidationVerdict::reject(
                RejectReason::UnknownTool,
                "empty_command",
                "command is empty",
            );
        };

        // Layer 1: tool whitelist
        let tool_name = first.to_lowercase();
        let Some(rule) = self.tools.get(&tool_name) else {
            debug!("Validator: unknown tool '{}' (user '{}')", first, ctx.user_id);
            return ValidationVerdict::reject(
                RejectReason::UnknownTool,
                "tool_whitelist",
                format!("tool '{}' is not in the approved tool set", first),
            );
        };

        // Layer 2: dangerous-pattern blocklist. A hard veto — runs against
        // the full raw string even though the tool is whitelisted.
        for pattern in &self.blocklist {
            if pattern.regex.is_match(raw) {
                warn!(
                    "Validator: blocked pattern '{}' in command from user '{}'",
                    pattern.name, ctx.user_id
                );
                return ValidationVerdict::reject(
                    RejectReason::BlockedPattern,
                    format!("blocklist:{}", pattern.name),
                    format!("command matches dangerous pattern '{}'", pattern.name),
                );
            }
        }

        let args: Vec<String> = tokens[1..].iter().map(|s| s.to_string()).collect();
        let parsed = ParsedCommand {
            tool: rule.name.clone(),
            category: rule.category,
            args,
        };

        // Layer 3: per-tool parameter validation
        if let Err((rule_id, detail)) = self.check_parameters(rule, &parsed) {
            debug!(
                "Validator: bad parameter for '{}' (user '{}'): {}",
                parsed.tool, ctx.user_id, detail
            );
            return ValidationVerdict::reject(RejectReason::BadParameter, rule_id, detail);
        }

        ValidationVerdict::allow(format!("whitelist:{}", rule.name), parsed)
    }

    fn check_parameters(
        &self,
        rule: &ToolRule,
        cmd: &ParsedCommand,
    ) -> Result<(), (String, String)> {
        if !rule.subcommands.is_empty() {
            match cmd.args.first() {
                Some(sub) if rule.subcommands.iter().any(|s| s == sub) => {}
                other => {
                    return Err((
                        format!("param:{}:subcommand", rule.name),
                        format!(
                            "'{}' requires a subcommand from {:?}, got {:?}",
                            rule.name, rule.subcommands, other
                        ),
                    ));
                }
            }
        }

        for arg in &cmd.args {
            if let Some(net) = parse_ip_or_cidr(arg) {
                if !self.in_target_networks(net) {
                    return Err((
                        "param:target_outside_training_net".to_string(),
                        format!("target '{}' is outside the training networks", arg),
                    ));
                }
                continue;
            }
            if arg.contains("://") {
                self.check_url(arg)?;
                continue;
            }
            // Recon tools take network targets; a bare hostname would
            // resolve outside our control, so only IPs and CIDRs pass.
            if rule.category == ToolCategory::Recon && looks_like_hostname(arg) {
                return Err((
                    "param:target_not_ip".to_string(),
                    format!("target '{}' must be an IP or CIDR, not a hostname", arg),
                ));
            }
        }
        Ok(())
    }

    fn check_url(&self, arg: &str) -> Result<(), (String, String)> {
        let url = Url::parse(arg).map_err(|e| {
            (
                "param:malformed_url".to_string(),
                format!("'{}' is not a valid URL: {}", arg, e),
            )
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err((
                "param:url_scheme".to_string(),
                format!("URL scheme '{}' is not allowed", url.scheme()),
            ));
        }
        let ip = match url.host() {
            Some(url::Host::Ipv4(ip)) => IpAddr::V4(ip),
            Some(url::Host::Ipv6(ip)) => IpAddr::V6(ip),
            _ => {
                return Err((
                    "param:url_host_not_ip".to_string(),
                    format!("URL host in '{}' must be an IP inside the training network", arg),
                ));
            }
        };
        if !self.target_networks.iter().any(|net| net.contains(ip)) {
            return Err((
                "param:target_outside_training_net".to_string(),
                format!("URL target '{}' is outside the training networks", arg),
            ));
        }
        Ok(())
    }

    fn in_target_networks(&self, net: IpNetwork) -> bool {
        self.target_networks
            .iter()
            .any(|allowed| allowed.contains(net.network()))
    }
}

fn parse_ip_or_cidr(token: &str) -> Option<IpNetwork> {
    token.parse::<IpNetwork>().ok()
}

/// Heuristic for dotted hostnames, exempting common output/wordlist files.
fn looks_like_hostname(token: &str) -> bool {
    if token.starts_with('-') || !token.contains('.') {
        return false;
    }
    const FILE_EXTENSIONS: &[&str] = &[".txt", ".lst", ".xml", ".json", ".csv", ".log"];
    if FILE_EXTENSIONS.iter().any(|ext| token.ends_with(ext)) {
        return false;
    }
    token
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-')
        && token.chars().any(|c| c.is_ascii_alphabetic())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator() -> CommandValidator {
        CommandValidator::new(&RuleSet::default())
    }

    fn ctx() -> ValidationContext {
        ValidationContext {
            user_id: "u1".to_string(),
            session_id: None,
        }
    }

    #[test]
    fn test_empty_command_rejected() {
        let verdict = validator().validate("", &ctx());
        assert!(!verdict.allowed);
        assert_eq!(verdict.reason, Some(RejectReason::UnknownTool));

        let verdict = validator().validate("   ", &ctx());
        assert_eq!(verdict.reason, Some(RejectReason::UnknownTool));
    }

    #[test]
    fn test_unknown_tool_rejected_regardless_of_args() {
        for raw in ["rm /tmp/x", "bash", "python3 exploit.py", "ls -la"] {
            let verdict = validator().validate(raw, &ctx());
            assert!(!verdict.allowed, "should reject: {}", raw);
            assert_eq!(verdict.reason, Some(RejectReason::UnknownTool));
        }
    }

    #[test]
    fn test_whitelisted_scan_allowed() {
        let verdict = validator().validate("nmap -sS -p 80,443 172.25.0.10", &ctx());
        assert!(verdict.allowed, "{:?}", verdict);
        let cmd = verdict.command.unwrap();
        assert_eq!(cmd.tool, "nmap");
        assert_eq!(cmd.category, ToolCategory::Recon);
        assert_eq!(cmd.args.len(), 4);
    }

    #[test]
    fn test_blocklist_vetoes_whitelist() {
        // Tool is whitelisted but the chaining metacharacter is a hard veto.
        let verdict = validator().validate("nmap 172.25.0.10; rm -rf /", &ctx());
        assert!(!verdict.allowed);
        assert_eq!(verdict.reason, Some(RejectReason::BlockedPattern));
        assert!(verdict.matched_rule.unwrap().starts_with("blocklist:"));
    }

    #[test]
    fn test_blocklist_pipe_and_substitution() {
        assert!(!validator().validate("nmap 172.25.0.10 | tee out", &ctx()).allowed);
        assert!(!validator().validate("ping $(whoami)", &ctx()).allowed);
        assert!(!validator().validate("ping `id`", &ctx()).allowed);
        assert!(!validator().validate("curl http://172.25.0.10/ > /etc/passwd", &ctx()).allowed);
    }

    #[test]
    fn test_blocklist_traversal_and_devices() {
        let verdict = validator().validate("curl http://172.25.0.10/../../etc/shadow", &ctx());
        assert_eq!(verdict.reason, Some(RejectReason::BlockedPattern));

        let verdict = validator().validate("nmap -iL /dev/sda", &ctx());
        assert_eq!(verdict.reason, Some(RejectReason::BlockedPattern));
    }

    #[test]
    fn test_target_outside_training_net_rejected() {
        let verdict = validator().validate("nmap -sS 8.8.8.8", &ctx());
        assert!(!verdict.allowed);
        assert_eq!(verdict.reason, Some(RejectReason::BadParameter));
        assert_eq!(
            verdict.matched_rule.as_deref(),
            Some("param:target_outside_training_net")
        );
    }

    #[test]
    fn test_cidr_target_inside_net_allowed() {
        let verdict = validator().validate("nmap -sn 172.25.0.0/28", &ctx());
        assert!(verdict.allowed, "{:?}", verdict);
    }

    #[test]
    fn test_hostname_target_rejected_for_recon() {
        let verdict = validator().validate("nmap scanme.nmap.org", &ctx());
        assert_eq!(verdict.reason, Some(RejectReason::BadParameter));
        assert_eq!(verdict.matched_rule.as_deref(), Some("param:target_not_ip"));
    }

    #[test]
    fn test_wordlist_file_not_mistaken_for_hostname() {
        let verdict = validator().validate("john --wordlist=rockyou.txt hashes.txt", &ctx());
        assert!(verdict.allowed, "{:?}", verdict);
    }

    #[test]
    fn test_url_target_in_training_net_allowed() {
        let verdict = validator().validate("nikto -h http://172.25.0.10/", &ctx());
        assert!(verdict.allowed, "{:?}", verdict);
    }

    #[test]
    fn test_url_target_outside_net_rejected() {
        let verdict = validator().validate("curl http://8.8.8.8/", &ctx());
        assert_eq!(verdict.reason, Some(RejectReason::BadParameter));
    }

    #[test]
    fn test_url_hostname_rejected() {
        let verdict = validator().validate("wget https://example.com/payload", &ctx());
        assert_eq!(verdict.reason, Some(RejectReason::BadParameter));
        assert_eq!(verdict.matched_rule.as_deref(), Some("param:url_host_not_ip"));
    }

    #[test]
    fn test_gobuster_requires_subcommand() {
        let verdict = validator().validate("gobuster -u http://172.25.0.10/", &ctx());
        assert_eq!(verdict.reason, Some(RejectReason::BadParameter));

        let verdict = validator().validate(
            "gobuster dir -u http://172.25.0.10/ -w common.txt",
            &ctx(),
        );
        assert!(verdict.allowed, "{:?}", verdict);
    }

    #[test]
    fn test_loopback_target_allowed() {
        let verdict = validator().validate("ping -c 1 127.0.0.1", &ctx());
        assert!(verdict.allowed, "{:?}", verdict);
    }

    #[test]
    fn test_verdict_serializes_without_nulls() {
        let verdict = validator().validate("nmap 172.25.0.10", &ctx());
        let json = serde_json::to_string(&verdict).unwrap();
        assert!(json.contains("\"allowed\":true"));
        assert!(!json.contains("\"reason\""));
    }

    #[test]
    fn test_custom_ruleset_replaces_defaults() {
        let rules = RuleSet {
            tools: vec![ToolRule {
                name: "echo-test".to_string(),
                category: ToolCategory::Recon,
                subcommands: Vec::new(),
            }],
            ..RuleSet::default()
        };
        let validator = CommandValidator::new(&rules);
        assert!(validator.validate("echo-test", &ctx()).allowed);
        assert!(!validator.validate("nmap 172.25.0.10", &ctx()).allowed);
    }

    #[test]
    fn test_bad_pattern_skipped_not_fatal() {
        let rules = RuleSet {
            blocklist: vec![PatternRule {
                name: "broken".to_string(),
                pattern: "([".to_string(),
            }],
            ..RuleSet::default()
        };
        let validator = CommandValidator::new(&rules);
        // Broken pattern is dropped; validation still works.
        assert!(validator.validate("nmap 172.25.0.10", &ctx()).allowed);
    }

    #[test]
    fn test_parsed_command_argv() {
        let verdict = validator().validate("nmap -sS 172.25.0.10", &ctx());
        let argv = verdict.command.unwrap().argv();
        assert_eq!(argv, vec!["nmap", "-sS", "172.25.0.10"]);
    }
}
