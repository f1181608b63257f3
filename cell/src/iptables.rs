//! Packet-filter commands.

use crate::{Error, FileLock, Result, Rule};
use std::{
    path::{Path, PathBuf},
    process::Stdio,
    sync::Arc,
};
use tokio::{io::AsyncWriteExt, process::Command};

#[cfg(any(test, feature = "test-util"))]
pub mod fake;

/// The packet-filter operations the enforcer and the attachment driver use.
#[async_trait::async_trait]
pub trait IpTables: Send + Sync {
    async fn new_chain(&self, table: &str, chain: &str) -> Result<()>;

    /// Appends `rules` to `chain` in a single restore transaction.
    async fn append_all(&self, table: &str, chain: &str, rules: &[Rule]) -> Result<()>;

    /// Inserts `rule` at 1-based `position`.
    async fn insert(&self, table: &str, chain: &str, position: usize, rule: &Rule) -> Result<()>;

    async fn delete(&self, table: &str, chain: &str, rule: &Rule) -> Result<()>;

    async fn list(&self, table: &str, chain: &str) -> Result<Vec<Rule>>;

    /// Lists the user-defined chains in `table`.
    async fn list_chains(&self, table: &str) -> Result<Vec<String>>;

    async fn flush_chain(&self, table: &str, chain: &str) -> Result<()>;

    async fn delete_chain(&self, table: &str, chain: &str) -> Result<()>;
}

/// Runs `iptables` and `iptables-restore`, optionally inside another network
/// namespace via `nsenter`.
#[derive(Clone, Debug)]
pub struct IpTablesCommand {
    iptables: PathBuf,
    restore: PathBuf,
    netns: Option<PathBuf>,
}

/// Holds a host-wide file lock around every command of the inner
/// implementation.
#[derive(Clone, Debug)]
pub struct LockedIpTables<T> {
    inner: T,
    lock: Arc<FileLock>,
}

// === impl IpTablesCommand ===

impl Default for IpTablesCommand {
    fn default() -> Self {
        Self {
            iptables: "iptables".into(),
            restore: "iptables-restore".into(),
            netns: None,
        }
    }
}

impl IpTablesCommand {
    pub fn new(iptables: impl Into<PathBuf>, restore: impl Into<PathBuf>) -> Self {
        Self {
            iptables: iptables.into(),
            restore: restore.into(),
            netns: None,
        }
    }

    /// Runs commands in the network namespace bound at `path`.
    pub fn in_netns(mut self, path: impl Into<PathBuf>) -> Self {
        self.netns = Some(path.into());
        self
    }

    fn command(&self, program: &Path) -> Command {
        match self.netns {
            Some(ref ns) => {
                let mut cmd = Command::new("nsenter");
                cmd.arg(format!("--net={}", ns.display())).arg(program);
                cmd
            }
            None => Command::new(program),
        }
    }

    async fn run<I, S>(&self, table: &str, args: I) -> Result<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        let mut cmd = self.command(&self.iptables);
        cmd.arg("-w").arg("-t").arg(table).args(args);
        cmd.stdin(Stdio::null());
        tracing::trace!(?cmd, "Running");
        let output = cmd.output().await?;
        if !output.status.success() {
            return Err(Error::Command {
                command: format!("{cmd:?}"),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait::async_trait]
impl IpTables for IpTablesCommand {
    async fn new_chain(&self, table: &str, chain: &str) -> Result<()> {
        self.run(table, ["-N", chain]).await.map(|_| ())
    }

    async fn append_all(&self, table: &str, chain: &str, rules: &[Rule]) -> Result<()> {
        if rules.is_empty() {
            return Ok(());
        }
        let input = restore_input(table, chain, rules);

        let mut cmd = self.command(&self.restore);
        cmd.args(["--noflush", "--wait"])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        tracing::trace!(?cmd, rules = rules.len(), "Running");
        let mut child = cmd.spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(input.as_bytes()).await?;
            stdin.shutdown().await?;
        }
        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(Error::Command {
                command: format!("{cmd:?}"),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }

    async fn insert(&self, table: &str, chain: &str, position: usize, rule: &Rule) -> Result<()> {
        let pos = position.to_string();
        let args = ["-I", chain, pos.as_str()]
            .into_iter()
            .chain(rule.args().iter().map(String::as_str));
        self.run(table, args).await.map(|_| ())
    }

    async fn delete(&self, table: &str, chain: &str, rule: &Rule) -> Result<()> {
        let args = ["-D", chain]
            .into_iter()
            .chain(rule.args().iter().map(String::as_str));
        self.run(table, args).await.map(|_| ())
    }

    async fn list(&self, table: &str, chain: &str) -> Result<Vec<Rule>> {
        let out = self.run(table, ["-S", chain]).await?;
        Ok(out
            .lines()
            .filter_map(|line| Rule::parse_listed(chain, line))
            .collect())
    }

    async fn list_chains(&self, table: &str) -> Result<Vec<String>> {
        let out = self.run(table, ["-S"]).await?;
        Ok(out
            .lines()
            .filter_map(|line| line.strip_prefix("-N "))
            .map(|name| name.trim().to_string())
            .collect())
    }

    async fn flush_chain(&self, table: &str, chain: &str) -> Result<()> {
        self.run(table, ["-F", chain]).await.map(|_| ())
    }

    async fn delete_chain(&self, table: &str, chain: &str) -> Result<()> {
        self.run(table, ["-X", chain]).await.map(|_| ())
    }
}

/// Renders an `iptables-restore` transaction appending `rules` to `chain`.
fn restore_input(table: &str, chain: &str, rules: &[Rule]) -> String {
    let mut input = format!("*{table}\n");
    for rule in rules {
        input.push_str(&format!("-A {chain} {rule}\n"));
    }
    input.push_str("COMMIT\n");
    input
}

// === impl LockedIpTables ===

impl<T> LockedIpTables<T> {
    pub fn new(inner: T, lock: Arc<FileLock>) -> Self {
        Self { inner, lock }
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }
}

#[async_trait::async_trait]
impl<T: IpTables> IpTables for LockedIpTables<T> {
    async fn new_chain(&self, table: &str, chain: &str) -> Result<()> {
        let _guard = self.lock.acquire().await?;
        self.inner.new_chain(table, chain).await
    }

    async fn append_all(&self, table: &str, chain: &str, rules: &[Rule]) -> Result<()> {
        let _guard = self.lock.acquire().await?;
        self.inner.append_all(table, chain, rules).await
    }

    async fn insert(&self, table: &str, chain: &str, position: usize, rule: &Rule) -> Result<()> {
        let _guard = self.lock.acquire().await?;
        self.inner.insert(table, chain, position, rule).await
    }

    async fn delete(&self, table: &str, chain: &str, rule: &Rule) -> Result<()> {
        let _guard = self.lock.acquire().await?;
        self.inner.delete(table, chain, rule).await
    }

    async fn list(&self, table: &str, chain: &str) -> Result<Vec<Rule>> {
        let _guard = self.lock.acquire().await?;
        self.inner.list(table, chain).await
    }

    async fn list_chains(&self, table: &str) -> Result<Vec<String>> {
        let _guard = self.lock.acquire().await?;
        self.inner.list_chains(table).await
    }

    async fn flush_chain(&self, table: &str, chain: &str) -> Result<()> {
        let _guard = self.lock.acquire().await?;
        self.inner.flush_chain(table, chain).await
    }

    async fn delete_chain(&self, table: &str, chain: &str) -> Result<()> {
        let _guard = self.lock.acquire().await?;
        self.inner.delete_chain(table, chain).await
    }
}

#[async_trait::async_trait]
impl<T: IpTables + ?Sized> IpTables for Arc<T> {
    async fn new_chain(&self, table: &str, chain: &str) -> Result<()> {
        (**self).new_chain(table, chain).await
    }

    async fn append_all(&self, table: &str, chain: &str, rules: &[Rule]) -> Result<()> {
        (**self).append_all(table, chain, rules).await
    }

    async fn insert(&self, table: &str, chain: &str, position: usize, rule: &Rule) -> Result<()> {
        (**self).insert(table, chain, position, rule).await
    }

    async fn delete(&self, table: &str, chain: &str, rule: &Rule) -> Result<()> {
        (**self).delete(table, chain, rule).await
    }

    async fn list(&self, table: &str, chain: &str) -> Result<Vec<Rule>> {
        (**self).list(table, chain).await
    }

    async fn list_chains(&self, table: &str) -> Result<Vec<String>> {
        (**self).list_chains(table).await
    }

    async fn flush_chain(&self, table: &str, chain: &str) -> Result<()> {
        (**self).flush_chain(table, chain).await
    }

    async fn delete_chain(&self, table: &str, chain: &str) -> Result<()> {
        (**self).delete_chain(table, chain).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn restore_input_appends_in_order() {
        let rules = [
            Rule::new(["-m", "conntrack", "--ctstate", "ESTABLISHED,RELATED"]).jump("ACCEPT"),
            Rule::new(["-s", "10.255.0.2"]).comment("src:app a").jump("DROP"),
        ];
        assert_eq!(
            restore_input("filter", "vpa--100", &rules),
            "*filter\n\
             -A vpa--100 -m conntrack --ctstate ESTABLISHED,RELATED -j ACCEPT\n\
             -A vpa--100 -s 10.255.0.2 -m comment --comment \"src:app a\" -j DROP\n\
             COMMIT\n"
        );
    }

    #[tokio::test]
    async fn command_failures_carry_stderr() {
        let ipt = IpTablesCommand::new("false", "false");
        match ipt.new_chain("filter", "x").await {
            Err(Error::Command { status, .. }) => assert!(!status.is_empty()),
            res => panic!("unexpected result: {res:?}"),
        }
    }
}
