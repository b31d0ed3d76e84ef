//! Bootstrap script execution.
//!
//! Scripts are split naively: whole-line `--` comments are dropped and the
//! rest is cut on every `;`. Dollar-quoted bodies, block comments, and `;`
//! inside string literals are not understood.

use crate::driver::StatementExecutor;
use crate::resource::ResourceResolver;
use crate::CoreError;
use serde::Serialize;
use std::fs;
use tracing::{debug, info};

/// Split a comma separated locator list, dropping blank entries.
pub fn parse_locators(csv: &str) -> Vec<String> {
    csv.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}

/// Statements of a script, in order.
///
/// Lines starting with `--` are removed and the remaining lines are
/// concatenated with no separator before splitting, so a statement spread
/// over several lines must keep its own whitespace. A `--` later in a line
/// is left in place and swallows whatever follows up to the next `;`.
pub fn parse_statements(text: &str) -> Vec<String> {
    let body: String = text
        .lines()
        .filter(|line| !line.starts_with("--"))
        .collect();
    body.split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}

/// What a run did, per source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScriptReport {
    /// `(locator, statements executed)` for every script that was found.
    pub executed: Vec<(String, usize)>,
    /// Locators that resolved to nothing.
    pub skipped: Vec<String>,
}

impl ScriptReport {
    pub fn total_statements(&self) -> usize {
        self.executed.iter().map(|(_, n)| n).sum()
    }
}

pub struct ScriptRunner<'a> {
    resolver: &'a dyn ResourceResolver,
}

impl<'a> ScriptRunner<'a> {
    pub fn new(resolver: &'a dyn ResourceResolver) -> Self {
        Self { resolver }
    }

    /// Execute every statement of every source, in order, on `conn`.
    ///
    /// Missing sources are skipped. The first failing statement aborts the
    /// run; statements already executed stay applied.
    pub fn run<C>(&self, sources: &[String], conn: &mut C) -> Result<ScriptReport, CoreError>
    where
        C: StatementExecutor + ?Sized,
    {
        let mut report = ScriptReport::default();

        for source in sources {
            let Some(path) = self.resolver.resolve(source) else {
                debug!("script {source} not found, skipping");
                report.skipped.push(source.clone());
                continue;
            };

            let text = fs::read_to_string(&path).map_err(|e| CoreError::ScriptRead {
                script: source.clone(),
                source: e,
            })?;
            let statements = parse_statements(&text);
            info!("executing {} statements from {source}", statements.len());

            for statement in &statements {
                debug!("{source}: {statement}");
                conn.execute(statement)
                    .map_err(|e| CoreError::ScriptExecution {
                        script: source.clone(),
                        statement: statement.clone(),
                        message: e.to_string(),
                    })?;
            }
            report.executed.push((source.clone(), statements.len()));
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::DriverError;
    use crate::resource::FsResourceResolver;

    #[derive(Default)]
    struct Recorder {
        executed: Vec<String>,
    }

    impl StatementExecutor for Recorder {
        fn execute(&mut self, statement: &str) -> Result<(), DriverError> {
            if statement.contains("INVALID") {
                return Err(DriverError::Other(format!("syntax error at {statement}")));
            }
            self.executed.push(statement.to_owned());
            Ok(())
        }
    }

    #[test]
    fn comment_lines_are_stripped() {
        assert_eq!(
            parse_statements("-- comment\nSELECT 1;\nSELECT 2;"),
            vec!["SELECT 1", "SELECT 2"]
        );
    }

    #[test]
    fn indented_and_mid_line_comments_are_kept() {
        let stmts = parse_statements("  -- indented\nSELECT 1; -- trailing\n");
        assert_eq!(stmts, vec!["-- indentedSELECT 1", "-- trailing"]);
    }

    #[test]
    fn lines_are_fused_without_separator() {
        assert_eq!(
            parse_statements("CREATE TABLE t \n(id int);"),
            vec!["CREATE TABLE t (id int)"]
        );
        assert_eq!(
            parse_statements("SELECT 1 -- note\nFROM t;"),
            vec!["SELECT 1 -- noteFROM t"]
        );
        assert_eq!(
            parse_statements("INSERT INTO t VALUES ('a\nb');"),
            vec!["INSERT INTO t VALUES ('ab')"]
        );
    }

    #[test]
    fn blank_and_empty_statements_are_dropped() {
        assert!(parse_statements("").is_empty());
        assert!(parse_statements(" ;;\n ; \n-- only a comment").is_empty());
        assert_eq!(parse_statements("SELECT 1"), vec!["SELECT 1"]);
    }

    #[test]
    fn locators_are_trimmed() {
        assert_eq!(
            parse_locators(" a.sql, classpath:b.sql ,, "),
            vec!["a.sql", "classpath:b.sql"]
        );
        assert!(parse_locators("  ").is_empty());
    }

    #[test]
    fn missing_script_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = FsResourceResolver::new(dir.path());
        let mut conn = Recorder::default();

        let report = ScriptRunner::new(&resolver)
            .run(&["nope.sql".to_owned()], &mut conn)
            .unwrap();
        assert!(conn.executed.is_empty());
        assert_eq!(report.skipped, vec!["nope.sql"]);
        assert_eq!(report.total_statements(), 0);
    }

    #[test]
    fn sources_run_in_order() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.sql"), "CREATE TABLE a (id int);").unwrap();
        fs::write(dir.path().join("b.sql"), "INSERT INTO a VALUES (1);\nINSERT INTO a VALUES (2);").unwrap();
        let resolver = FsResourceResolver::new(dir.path());
        let mut conn = Recorder::default();

        let report = ScriptRunner::new(&resolver)
            .run(&parse_locators("a.sql,missing.sql,b.sql"), &mut conn)
            .unwrap();
        assert_eq!(
            conn.executed,
            vec![
                "CREATE TABLE a (id int)",
                "INSERT INTO a VALUES (1)",
                "INSERT INTO a VALUES (2)"
            ]
        );
        assert_eq!(
            report.executed,
            vec![("a.sql".to_owned(), 1), ("b.sql".to_owned(), 2)]
        );
        assert_eq!(report.skipped, vec!["missing.sql"]);
    }

    #[test]
    fn failing_statement_aborts_the_rest() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("s.sql"), "A;B_INVALID;C;").unwrap();
        fs::write(dir.path().join("t.sql"), "D;").unwrap();
        let resolver = FsResourceResolver::new(dir.path());
        let mut conn = Recorder::default();

        let err = ScriptRunner::new(&resolver)
            .run(&parse_locators("s.sql,t.sql"), &mut conn)
            .unwrap_err();
        assert_eq!(conn.executed, vec!["A"]);
        match err {
            CoreError::ScriptExecution {
                script,
                statement,
                message,
            } => {
                assert_eq!(script, "s.sql");
                assert_eq!(statement, "B_INVALID");
                assert!(message.contains("syntax error"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn empty_source_list_is_a_no_op() {
        let resolver = |_: &str| -> Option<std::path::PathBuf> { panic!("must not resolve") };
        let mut conn = Recorder::default();
        let report = ScriptRunner::new(&resolver).run(&[], &mut conn).unwrap();
        assert_eq!(report, ScriptReport::default());
    }
}
