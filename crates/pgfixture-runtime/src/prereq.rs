use crate::native::PgBinaries;
use std::fmt;
use std::path::Path;

/// A missing prerequisite with actionable install instructions.
#[derive(Debug)]
pub struct MissingPrereq {
    pub name: &'static str,
    pub purpose: &'static str,
    pub install_hint: &'static str,
}

impl fmt::Display for MissingPrereq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "  - {}: {} (install: {})",
            self.name, self.purpose, self.install_hint
        )
    }
}

const INSTALL_HINT: &str =
    "apt install postgresql | dnf install postgresql-server | brew install postgresql, or set bin_dir";

fn purpose(tool: &str) -> &'static str {
    match tool {
        "initdb" => "creating the throwaway cluster",
        "postgres" => "running the database server",
        "pg_ctl" => "stopping the server cleanly",
        "pg_isready" => "detecting when the server accepts connections",
        "createdb" => "creating the configured database",
        _ => "running the native backend",
    }
}

/// Check the binaries the native backend needs for PostgreSQL `major`.
/// Returns an empty list when everything is present.
pub fn check_native_prereqs(bin_dir: Option<&Path>, major: u32) -> Vec<MissingPrereq> {
    match PgBinaries::locate(bin_dir, major) {
        Ok(_) => Vec::new(),
        Err(missing) => missing
            .into_iter()
            .map(|name| MissingPrereq {
                name,
                purpose: purpose(name),
                install_hint: INSTALL_HINT,
            })
            .collect(),
    }
}

/// Format a list of missing prerequisites into a user-friendly error message.
pub fn format_missing(missing: &[MissingPrereq]) -> String {
    use std::fmt::Write as _;
    let mut msg = String::from("missing prerequisites:\n");
    for m in missing {
        let _ = writeln!(msg, "{m}");
    }
    msg.push_str("\nThe native backend runs PostgreSQL binaries installed on this host.");
    msg
}
