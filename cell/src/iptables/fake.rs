//! An in-memory packet filter that mimics the command's failure modes and
//! records every operation.

use super::IpTables;
use crate::{Error, Result, Rule};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Default)]
pub struct FakeIpTables {
    state: Mutex<State>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Op {
    NewChain(String),
    AppendAll(String, Vec<Rule>),
    Insert(String, usize, Rule),
    Delete(String, Rule),
    Flush(String),
    DeleteChain(String),
}

#[derive(Debug, Default)]
struct State {
    chains: BTreeMap<(String, String), Vec<Rule>>,
    builtin: BTreeSet<(String, String)>,
    ops: Vec<Op>,
    failures: Vec<(&'static str, String)>,
    watched: Option<(String, String)>,
    history: Vec<Vec<Rule>>,
}

// === impl FakeIpTables ===

impl FakeIpTables {
    /// Creates a filter with the given built-in chains.
    pub fn with_builtin<'a>(chains: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let fake = Self::default();
        {
            let mut state = fake.state.lock();
            for (table, chain) in chains {
                let key = (table.to_string(), chain.to_string());
                state.chains.insert(key.clone(), Vec::new());
                state.builtin.insert(key);
            }
        }
        fake
    }

    /// Records the contents of `chain` after every mutation.
    pub fn watch(&self, table: &str, chain: &str) {
        let mut state = self.state.lock();
        state.watched = Some((table.to_string(), chain.to_string()));
        state.history.clear();
    }

    pub fn history(&self) -> Vec<Vec<Rule>> {
        self.state.lock().history.clone()
    }

    /// Fails every `op` (`new_chain`, `append_all`, `insert`, `delete`,
    /// `flush_chain` or `delete_chain`) on chains starting with `prefix`.
    pub fn fail_on(&self, op: &'static str, prefix: &str) {
        self.state.lock().failures.push((op, prefix.to_string()));
    }

    pub fn clear_failures(&self) {
        self.state.lock().failures.clear();
    }

    pub fn ops(&self) -> Vec<Op> {
        self.state.lock().ops.clone()
    }

    pub fn rules(&self, table: &str, chain: &str) -> Option<Vec<Rule>> {
        self.state
            .lock()
            .chains
            .get(&(table.to_string(), chain.to_string()))
            .cloned()
    }

    /// Lists every chain in `table`, built-in ones included.
    pub fn chains(&self, table: &str) -> Vec<String> {
        self.state
            .lock()
            .chains
            .keys()
            .filter(|(t, _)| t == table)
            .map(|(_, c)| c.clone())
            .collect()
    }

    /// Seeds `chain` with rules without recording an operation.
    pub fn seed(&self, table: &str, chain: &str, rules: Vec<Rule>) {
        self.state
            .lock()
            .chains
            .insert((table.to_string(), chain.to_string()), rules);
    }

    fn mutate<T>(
        &self,
        op: &'static str,
        table: &str,
        chain: &str,
        record: Op,
        f: impl FnOnce(&mut State, (String, String)) -> Result<T>,
    ) -> Result<T> {
        let mut state = self.state.lock();
        if state
            .failures
            .iter()
            .any(|(o, prefix)| *o == op && chain.starts_with(prefix.as_str()))
        {
            return Err(failed(op, chain, "injected failure"));
        }
        let out = f(&mut *state, (table.to_string(), chain.to_string()))?;
        state.ops.push(record);
        if let Some(watched) = state.watched.clone() {
            let rules = state.chains.get(&watched).cloned().unwrap_or_default();
            state.history.push(rules);
        }
        Ok(out)
    }
}

fn failed(op: &str, chain: &str, msg: &str) -> Error {
    Error::Command {
        command: format!("{op} {chain}"),
        status: "exit status: 1".to_string(),
        stderr: msg.to_string(),
    }
}

fn missing(op: &str, chain: &str) -> Error {
    failed(op, chain, "No chain/target/match by that name.")
}

fn is_referenced(state: &State, table: &str, chain: &str) -> bool {
    state
        .chains
        .iter()
        .filter(|((t, _), _)| t == table)
        .flat_map(|(_, rules)| rules)
        .any(|r| r.target() == Some(chain))
}

#[async_trait::async_trait]
impl IpTables for FakeIpTables {
    async fn new_chain(&self, table: &str, chain: &str) -> Result<()> {
        let record = Op::NewChain(chain.to_string());
        self.mutate("new_chain", table, chain, record, |state, key| {
            if state.chains.contains_key(&key) {
                return Err(failed("new_chain", chain, "Chain already exists."));
            }
            state.chains.insert(key, Vec::new());
            Ok(())
        })
    }

    async fn append_all(&self, table: &str, chain: &str, rules: &[Rule]) -> Result<()> {
        let record = Op::AppendAll(chain.to_string(), rules.to_vec());
        self.mutate("append_all", table, chain, record, |state, key| {
            let existing = state
                .chains
                .get_mut(&key)
                .ok_or_else(|| missing("append_all", chain))?;
            existing.extend_from_slice(rules);
            Ok(())
        })
    }

    async fn insert(&self, table: &str, chain: &str, position: usize, rule: &Rule) -> Result<()> {
        let record = Op::Insert(chain.to_string(), position, rule.clone());
        self.mutate("insert", table, chain, record, |state, key| {
            let existing = state
                .chains
                .get_mut(&key)
                .ok_or_else(|| missing("insert", chain))?;
            if position == 0 || position > existing.len() + 1 {
                return Err(failed("insert", chain, "Index of insertion too big."));
            }
            existing.insert(position - 1, rule.clone());
            Ok(())
        })
    }

    async fn delete(&self, table: &str, chain: &str, rule: &Rule) -> Result<()> {
        let record = Op::Delete(chain.to_string(), rule.clone());
        self.mutate("delete", table, chain, record, |state, key| {
            let existing = state
                .chains
                .get_mut(&key)
                .ok_or_else(|| missing("delete", chain))?;
            let idx = existing
                .iter()
                .position(|r| r == rule)
                .ok_or_else(|| failed("delete", chain, "Bad rule."))?;
            existing.remove(idx);
            Ok(())
        })
    }

    async fn list(&self, table: &str, chain: &str) -> Result<Vec<Rule>> {
        self.rules(table, chain).ok_or_else(|| missing("list", chain))
    }

    async fn list_chains(&self, table: &str) -> Result<Vec<String>> {
        let state = self.state.lock();
        Ok(state
            .chains
            .keys()
            .filter(|key| key.0 == table && !state.builtin.contains(*key))
            .map(|(_, c)| c.clone())
            .collect())
    }

    async fn flush_chain(&self, table: &str, chain: &str) -> Result<()> {
        let record = Op::Flush(chain.to_string());
        self.mutate("flush_chain", table, chain, record, |state, key| {
            state
                .chains
                .get_mut(&key)
                .ok_or_else(|| missing("flush_chain", chain))?
                .clear();
            Ok(())
        })
    }

    async fn delete_chain(&self, table: &str, chain: &str) -> Result<()> {
        let record = Op::DeleteChain(chain.to_string());
        self.mutate("delete_chain", table, chain, record, |state, key| {
            if state.builtin.contains(&key) {
                return Err(failed("delete_chain", chain, "Cannot delete built-in chain."));
            }
            match state.chains.get(&key) {
                None => return Err(missing("delete_chain", chain)),
                Some(rules) if !rules.is_empty() => {
                    return Err(failed("delete_chain", chain, "Directory not empty."))
                }
                Some(_) => {}
            }
            if is_referenced(state, table, chain) {
                return Err(failed("delete_chain", chain, "Too many links."));
            }
            state.chains.remove(&key);
            Ok(())
        })
    }
}
