//! Local suggestion rules used when no external provider is configured, or
//! when it fails.
//!
//! The tables are plain data; [`classify`] walks them in a fixed order:
//! scanner syntax errors, permission problems, missing tools, canned
//! follow-ups for clean commands, tool tips, generic errors and finally a
//! task-biased exploration hint.

use crate::advice::{AnalysisRequest, HistoryEntry, Suggestion, SuggestionKind};

/// A suggestion with static text.
#[derive(Debug, Clone, Copy)]
pub struct Hint {
    pub kind: SuggestionKind,
    pub title: &'static str,
    pub message: &'static str,
    pub command: Option<&'static str>,
    pub rationale: &'static str,
}

impl Hint {
    pub fn to_suggestion(&self) -> Suggestion {
        Suggestion {
            kind: self.kind,
            title: self.title.to_string(),
            message: self.message.to_string(),
            command: self.command.map(str::to_string),
            rationale: self.rationale.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum CommandMatch {
    Exact(&'static str),
    Prefix(&'static str),
}

impl CommandMatch {
    fn matches(&self, cmd: &str) -> bool {
        match self {
            CommandMatch::Exact(s) => cmd == *s,
            CommandMatch::Prefix(s) => cmd.starts_with(s),
        }
    }
}

/// Follow-ups for basic commands that ran cleanly.
pub static QUICK_HINTS: &[(CommandMatch, Hint)] = &[
    (
        CommandMatch::Exact("ls"),
        Hint {
            kind: SuggestionKind::NextStep,
            title: "Directory listing",
            message: "Basic file listing complete.",
            command: Some("ls -lah"),
            rationale: "Shows permissions, ownership, sizes and hidden files",
        },
    ),
    (
        CommandMatch::Exact("df"),
        Hint {
            kind: SuggestionKind::NextStep,
            title: "Disk space",
            message: "Disk usage displayed.",
            command: Some("df -h"),
            rationale: "Human readable sizes; df -i shows inode limits",
        },
    ),
    (
        CommandMatch::Prefix("cd "),
        Hint {
            kind: SuggestionKind::NextStep,
            title: "Directory changed",
            message: "Directory navigation complete.",
            command: Some("ls -la"),
            rationale: "Confirm where you are and explore the new directory",
        },
    ),
    (
        CommandMatch::Exact("whoami"),
        Hint {
            kind: SuggestionKind::NextStep,
            title: "User identity",
            message: "Current user identified.",
            command: Some("sudo -l"),
            rationale: "Check which privileged commands this user may run",
        },
    ),
    (
        CommandMatch::Exact("pwd"),
        Hint {
            kind: SuggestionKind::NextStep,
            title: "Current location",
            message: "Working directory displayed.",
            command: Some("ls -la"),
            rationale: "Explore the current directory or move with cd ..",
        },
    ),
];

/// Tools that need root for what students usually do with them.
pub static PRIVILEGED_TOOLS: &[(&str, &str)] = &[
    ("nmap", "Network tools need root privileges for raw sockets"),
    ("tcpdump", "Network tools need root privileges for raw sockets"),
    ("apache", "Service management requires admin rights"),
    ("systemctl", "Service management requires admin rights"),
    ("service", "Service management requires admin rights"),
];

pub struct InstallHint {
    pub tool: &'static str,
    pub install: &'static str,
    pub reason: &'static str,
}

pub static INSTALL_HINTS: &[InstallHint] = &[
    InstallHint {
        tool: "wireshark",
        install: "sudo apt install wireshark",
        reason: "Network protocol analyzer",
    },
    InstallHint {
        tool: "metasploit",
        install: "msfconsole",
        reason: "Metasploit is already installed; start it with msfconsole",
    },
    InstallHint {
        tool: "sqlmap",
        install: "sudo apt install sqlmap",
        reason: "SQL injection testing tool",
    },
    InstallHint {
        tool: "nikto",
        install: "sudo apt install nikto",
        reason: "Web server scanner",
    },
];

/// Learning tips keyed by command substrings.
pub static TOOL_TIPS: &[(&[&str], Hint)] = &[
    (
        &["john"],
        Hint {
            kind: SuggestionKind::LearningTip,
            title: "Password cracking",
            message: "John the Ripper is a powerful password auditing tool.",
            command: Some("john --wordlist=/usr/share/wordlists/rockyou.txt <hashfile>"),
            rationale: "Dictionary attacks are often more effective than brute force",
        },
    ),
    (
        &["msfconsole", "meterpreter"],
        Hint {
            kind: SuggestionKind::LearningTip,
            title: "Metasploit framework",
            message: "Follow the workflow: search, use, show options, set, exploit.",
            command: Some("search <vulnerability>"),
            rationale: "Systematic exploitation requires understanding the target and its options",
        },
    ),
    (
        &["apache", "nginx", "service", "systemctl"],
        Hint {
            kind: SuggestionKind::LearningTip,
            title: "Service management",
            message: "Managing services is key to both attack and defense.",
            command: Some("systemctl status <service>"),
            rationale: "journalctl -u <service> shows the logs behind a failing unit",
        },
    ),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Task {
    NetworkScanning,
    PasswordCracking,
    WebServerSetup,
    NetworkAnalysis,
    PenetrationTesting,
    GeneralExploration,
}

impl Task {
    pub fn describe(&self) -> &'static str {
        match self {
            Task::NetworkScanning => "network scanning",
            Task::PasswordCracking => "password cracking",
            Task::WebServerSetup => "web server setup",
            Task::NetworkAnalysis => "network analysis",
            Task::PenetrationTesting => "penetration testing",
            Task::GeneralExploration => "general exploration",
        }
    }
}

pub static TASKS: &[(&[&str], Task)] = &[
    (&["nmap"], Task::NetworkScanning),
    (&["john", "hashcat"], Task::PasswordCracking),
    (&["apache", "nginx"], Task::WebServerSetup),
    (&["wireshark", "tcpdump"], Task::NetworkAnalysis),
    (&["msfconsole", "exploit"], Task::PenetrationTesting),
];

/// Next commands worth trying once a tool is in use.
pub static NEXT_STEPS: &[(&str, &str)] = &[
    ("nmap", "nmap -sV <target>"),
    ("apache", "sudo tail /var/log/apache2/error.log"),
    ("john", "john --list=formats"),
    ("msfconsole", "show options"),
];

fn task_for(cmd: &str) -> Option<Task> {
    TASKS
        .iter()
        .find(|(needles, _)| needles.iter().any(|n| cmd.contains(n)))
        .map(|(_, task)| *task)
}

/// The task the student seems to be on: the current command first, then
/// the most recent history entry that points at one.
pub fn detect_task(cmd: &str, history: &[HistoryEntry]) -> Task {
    task_for(cmd)
        .or_else(|| {
            history
                .iter()
                .rev()
                .find_map(|entry| task_for(&entry.command.to_lowercase()))
        })
        .unwrap_or(Task::GeneralExploration)
}

fn nmap_syntax_error() -> Suggestion {
    Suggestion {
        kind: SuggestionKind::ErrorHelp,
        title: "Nmap syntax error".to_string(),
        message: "Nmap flags are case-sensitive and have specific formats.".to_string(),
        command: Some("nmap -sS <target>".to_string()),
        rationale: "Common scans: -sS (stealth), -sV (version), -A (aggressive), -p (ports)".to_string(),
    }
}

/// Picks a suggestion for `request` from the tables above. Never fails.
pub fn classify(request: &AnalysisRequest) -> Suggestion {
    let raw_command = request.command.as_deref().unwrap_or("").trim();
    let cmd = raw_command.to_lowercase();
    let errors = request.error_output.to_lowercase();
    let everything = format!("{} {}", request.output, request.error_output).to_lowercase();
    let has_error = !request.error_output.trim().is_empty();

    if cmd.contains("nmap")
        && ["quitting", "invalid argument", "unrecognized option"]
            .iter()
            .any(|p| everything.contains(p))
    {
        return nmap_syntax_error();
    }

    if errors.contains("permission denied") {
        if let Some((_, why)) = PRIVILEGED_TOOLS.iter().find(|(tool, _)| cmd.contains(tool)) {
            return Suggestion {
                kind: SuggestionKind::ErrorHelp,
                title: "Needs root privileges".to_string(),
                message: format!("Try: sudo {raw_command}"),
                command: Some(format!("sudo {raw_command}")),
                rationale: why.to_string(),
            };
        }
    }

    if errors.contains("command not found") {
        let tool = cmd.split_whitespace().next().unwrap_or("");
        if let Some(hint) = INSTALL_HINTS.iter().find(|h| h.tool == tool) {
            return Suggestion {
                kind: SuggestionKind::InstallHelp,
                title: "Tool missing".to_string(),
                message: format!("Install: {}", hint.install),
                command: Some(hint.install.to_string()),
                rationale: hint.reason.to_string(),
            };
        }
    }

    if !has_error {
        if let Some((_, hint)) = QUICK_HINTS.iter().find(|(m, _)| m.matches(&cmd)) {
            return hint.to_suggestion();
        }
        if cmd.starts_with("nmap") && request.output.contains("open") {
            return Suggestion {
                kind: SuggestionKind::NextStep,
                title: "Open ports discovered".to_string(),
                message: "Found open services on the target.".to_string(),
                command: Some("nmap -sV -sC <target>".to_string()),
                rationale: "Identify service versions and run the default scripts".to_string(),
            };
        }
        if cmd.contains("john") && request.output.contains("Loaded") {
            return Suggestion {
                kind: SuggestionKind::NextStep,
                title: "Hashes loaded".to_string(),
                message: "Ready for password cracking.".to_string(),
                command: Some("john --wordlist=/usr/share/wordlists/rockyou.txt <hashfile>".to_string()),
                rationale: "Dictionary attacks are the most effective first step".to_string(),
            };
        }
    }

    if let Some((_, hint)) = TOOL_TIPS
        .iter()
        .find(|(needles, _)| needles.iter().any(|n| cmd.contains(n)))
    {
        return hint.to_suggestion();
    }

    if cmd.contains("nmap") && !has_error {
        return Suggestion {
            kind: SuggestionKind::NextStep,
            title: "Network scanning progress".to_string(),
            message: "Good progress on network reconnaissance.".to_string(),
            command: Some("nmap -sV <target>".to_string()),
            rationale: "Knowing which services run is the start of a vulnerability assessment".to_string(),
        };
    }

    if has_error {
        let tool = raw_command.split_whitespace().next().filter(|t| !t.is_empty());
        return Suggestion {
            kind: SuggestionKind::ErrorHelp,
            title: "Command error".to_string(),
            message: "Errors are part of learning. Check the command's syntax.".to_string(),
            command: tool.map(|t| format!("man {t}")),
            rationale: "Reading documentation builds troubleshooting skills".to_string(),
        };
    }

    let task = detect_task(&cmd, &request.history);
    let next = NEXT_STEPS
        .iter()
        .find(|(tool, _)| cmd.contains(tool))
        .map(|(_, next)| next.to_string());
    Suggestion {
        kind: SuggestionKind::General,
        title: "Keep exploring".to_string(),
        message: format!("You're working on {}. Every command builds expertise.", task.describe()),
        command: next,
        rationale: "Hands-on practice is the best way to learn these tools".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(command: &str, output: &str, errors: &str) -> AnalysisRequest {
        AnalysisRequest {
            student_id: "alice".to_string(),
            command: (!command.is_empty()).then(|| command.to_string()),
            output: output.to_string(),
            error_output: errors.to_string(),
            history: Vec::new(),
            question: None,
        }
    }

    #[test]
    fn nmap_quitting_is_a_syntax_error() {
        let s = classify(&request("nmap -djf 127.0.0.1", "", "QUITTING!"));
        assert_eq!(s.kind, SuggestionKind::ErrorHelp);
        assert_eq!(s.title, "Nmap syntax error");
    }

    #[test]
    fn permission_denied_on_network_tool_suggests_sudo() {
        let s = classify(&request("tcpdump -i eth0", "", "tcpdump: eth0: Permission denied"));
        assert_eq!(s.kind, SuggestionKind::ErrorHelp);
        assert_eq!(s.command.as_deref(), Some("sudo tcpdump -i eth0"));
    }

    #[test]
    fn missing_tool_gets_an_install_hint() {
        let s = classify(&request("sqlmap -u x", "", "bash: sqlmap: command not found"));
        assert_eq!(s.kind, SuggestionKind::InstallHelp);
        assert_eq!(s.command.as_deref(), Some("sudo apt install sqlmap"));

        // Unknown tools fall through to the generic error branch.
        let s = classify(&request("frobnicate", "", "bash: frobnicate: command not found"));
        assert_eq!(s.kind, SuggestionKind::ErrorHelp);
        assert_eq!(s.command.as_deref(), Some("man frobnicate"));
    }

    #[test]
    fn clean_basic_commands_get_next_steps() {
        assert_eq!(classify(&request("ls", "a b c", "")).command.as_deref(), Some("ls -lah"));
        assert_eq!(classify(&request("cd /etc", "", "")).title, "Directory changed");
        let s = classify(&request("nmap 10.0.0.1", "22/tcp open ssh", ""));
        assert_eq!(s.title, "Open ports discovered");
    }

    #[test]
    fn tool_tips_cover_known_tools() {
        assert_eq!(classify(&request("john hashes.txt", "", "")).kind, SuggestionKind::LearningTip);
        assert_eq!(classify(&request("msfconsole", "", "")).title, "Metasploit framework");
    }

    #[test]
    fn generic_branch_uses_history_to_pick_the_task() {
        let mut req = request("cat notes.txt", "some notes", "");
        req.history = vec![HistoryEntry {
            command: "hashcat -m 0 hashes".to_string(),
            had_error: false,
        }];
        let s = classify(&req);
        assert_eq!(s.kind, SuggestionKind::General);
        assert!(s.message.contains("password cracking"), "{}", s.message);

        let s = classify(&request("", "lots of output", ""));
        assert!(s.message.contains("general exploration"));
    }
}
