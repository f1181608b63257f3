use super::*;
use parking_lot::Mutex;

/// Records calls and answers `add` with a canned result.
#[derive(Debug, Default)]
pub struct FakePlugins {
    result: Mutex<AddResult>,
    fail_add: Mutex<Option<String>>,
    fail_del: Mutex<Option<String>>,
    calls: Mutex<Vec<Call>>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Call {
    Add(AddRequest),
    Del { netns: PathBuf, handle: String },
}

impl FakePlugins {
    /// Answers with a single interface carrying `ip`.
    pub fn assigning(ip: Ipv4Addr) -> Self {
        let fake = Self::default();
        fake.set_result(AddResult {
            interfaces: vec![Interface {
                name: "eth0".to_string(),
                sandbox: None,
            }],
            ips: vec![IpConfig {
                version: Some("4".to_string()),
                address: format!("{ip}/24"),
                gateway: None,
                interface: Some(0),
            }],
            dns: Dns::default(),
        });
        fake
    }

    pub fn set_result(&self, result: AddResult) {
        *self.result.lock() = result;
    }

    pub fn fail_add(&self, message: Option<&str>) {
        *self.fail_add.lock() = message.map(Into::into);
    }

    pub fn fail_del(&self, message: Option<&str>) {
        *self.fail_del.lock() = message.map(Into::into);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }
}

#[async_trait::async_trait]
impl PluginChain for FakePlugins {
    async fn add(&self, req: &AddRequest) -> Result<AddResult> {
        self.calls.lock().push(Call::Add(req.clone()));
        if let Some(message) = self.fail_add.lock().clone() {
            return Err(Error::plugin("fake", message));
        }
        Ok(self.result.lock().clone())
    }

    async fn del(&self, netns: &Path, handle: &str) -> Result<()> {
        self.calls.lock().push(Call::Del {
            netns: netns.to_path_buf(),
            handle: handle.to_string(),
        });
        if let Some(message) = self.fail_del.lock().clone() {
            return Err(Error::plugin("fake", message));
        }
        Ok(())
    }
}
