//! Attack signature matching over request paths and query strings.
//!
//! All patterns are compiled into one case-insensitive Aho-Corasick
//! automaton; the input is percent-decoded twice so single and double
//! encoding are both caught.

use std::collections::BTreeSet;

use aho_corasick::AhoCorasick;
use serde::Serialize;

use crate::security::error::SetupError;

/// Family a signature belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttackKind {
    PathTraversal,
    SqlInjection,
    Xss,
    SensitiveFile,
    CommandInjection,
}

impl AttackKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PathTraversal => "path_traversal",
            Self::SqlInjection => "sql_injection",
            Self::Xss => "xss",
            Self::SensitiveFile => "sensitive_file",
            Self::CommandInjection => "command_injection",
        }
    }

    /// Score contribution of one match of this family.
    pub fn weight(&self) -> u32 {
        match self {
            Self::PathTraversal => 45,
            Self::SqlInjection => 50,
            Self::Xss => 45,
            Self::SensitiveFile => 40,
            Self::CommandInjection => 50,
        }
    }
}

const SIGNATURES: &[(&str, AttackKind)] = &[
    ("../", AttackKind::PathTraversal),
    ("..\\", AttackKind::PathTraversal),
    ("/etc/passwd", AttackKind::PathTraversal),
    ("/proc/self", AttackKind::PathTraversal),
    ("c:\\windows", AttackKind::PathTraversal),
    ("' or '1'='1", AttackKind::SqlInjection),
    ("' or 1=1", AttackKind::SqlInjection),
    ("\" or \"1\"=\"1", AttackKind::SqlInjection),
    ("union select", AttackKind::SqlInjection),
    ("union all select", AttackKind::SqlInjection),
    ("; drop table", AttackKind::SqlInjection),
    ("information_schema", AttackKind::SqlInjection),
    ("sleep(", AttackKind::SqlInjection),
    ("benchmark(", AttackKind::SqlInjection),
    ("<script", AttackKind::Xss),
    ("javascript:", AttackKind::Xss),
    ("onerror=", AttackKind::Xss),
    ("onload=", AttackKind::Xss),
    ("<iframe", AttackKind::Xss),
    ("<svg", AttackKind::Xss),
    ("document.cookie", AttackKind::Xss),
    ("/.env", AttackKind::SensitiveFile),
    ("/.git/", AttackKind::SensitiveFile),
    ("/.htaccess", AttackKind::SensitiveFile),
    ("/.aws/", AttackKind::SensitiveFile),
    ("/wp-admin", AttackKind::SensitiveFile),
    ("/wp-login.php", AttackKind::SensitiveFile),
    ("/phpmyadmin", AttackKind::SensitiveFile),
    ("/server-status", AttackKind::SensitiveFile),
    ("id_rsa", AttackKind::SensitiveFile),
    ("web.config", AttackKind::SensitiveFile),
    (";cat ", AttackKind::CommandInjection),
    ("|cat ", AttackKind::CommandInjection),
    ("$(", AttackKind::CommandInjection),
    ("`id`", AttackKind::CommandInjection),
    ("&& whoami", AttackKind::CommandInjection),
];

/// Compiled signature set.
#[derive(Debug, Clone)]
pub struct SignatureSet {
    automaton: AhoCorasick,
    kinds: Vec<AttackKind>,
}

impl SignatureSet {
    pub fn builtin() -> Result<Self, SetupError> {
        let automaton = AhoCorasick::builder()
            .ascii_case_insensitive(true)
            .build(SIGNATURES.iter().map(|(p, _)| p))
            .map_err(|e| SetupError::Signatures(e.to_string()))?;
        Ok(Self {
            automaton,
            kinds: SIGNATURES.iter().map(|(_, k)| *k).collect(),
        })
    }

    /// Families matched by `target` (a path plus optional query).
    pub fn scan(&self, target: &str) -> BTreeSet<AttackKind> {
        let once = decode(target);
        let twice = decode(&once);

        let mut found = BTreeSet::new();
        for input in [target, once.as_str(), twice.as_str()] {
            for m in self.automaton.find_overlapping_iter(input) {
                found.insert(self.kinds[m.pattern().as_usize()]);
            }
        }
        found
    }
}

fn decode(input: &str) -> String {
    let plus_as_space = input.replace('+', " ");
    String::from_utf8_lossy(&urlencoding::decode_binary(plus_as_space.as_bytes())).into_owned()
}
