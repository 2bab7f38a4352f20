//! Recording transport used by the registry tests

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::{
    CloseNotifier, CloseReason, ConnectionHandle, Inbound, MessageHandler, TransportError,
    TransportFactory, TransportResult,
};

/// Everything the mock transport observed
#[derive(Default)]
pub struct MockLog {
    /// (connection name, payload) for every successful send
    pub sends: Vec<(String, String)>,
    /// Names of released handles, in release order
    pub releases: Vec<String>,
    pub factory_releases: usize,
    notifiers: HashMap<String, CloseNotifier>,
    handlers: HashMap<String, MessageHandler>,
}

pub type SharedLog = Arc<Mutex<MockLog>>;

#[derive(Clone, Default)]
pub struct MockConfig {
    pub log: SharedLog,
    pub fail_create: bool,
}

impl MockConfig {
    pub fn failing() -> Self {
        Self {
            fail_create: true,
            ..Self::default()
        }
    }
}

/// Upgrade context for the mock: a name plus optional scripted failures
pub struct MockUpgrade {
    pub name: String,
    pub fail: Option<TransportError>,
    pub fail_send: bool,
}

impl MockUpgrade {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            fail: None,
            fail_send: false,
        }
    }

    pub fn failing(name: &str, err: TransportError) -> Self {
        Self {
            fail: Some(err),
            ..Self::new(name)
        }
    }

    pub fn broken_pipe(name: &str) -> Self {
        Self {
            fail_send: true,
            ..Self::new(name)
        }
    }
}

pub struct MockFactory {
    log: SharedLog,
}

pub struct MockHandle {
    name: String,
    log: SharedLog,
    fail_send: bool,
}

impl TransportFactory for MockFactory {
    type Config = MockConfig;
    type Upgrade = MockUpgrade;
    type Handle = MockHandle;

    fn create(config: &MockConfig) -> TransportResult<Self> {
        if config.fail_create {
            return Err(TransportError::Runtime("mock factory unavailable".into()));
        }
        Ok(Self {
            log: Arc::clone(&config.log),
        })
    }

    fn try_accept(
        &self,
        upgrade: MockUpgrade,
        on_message: MessageHandler,
        on_close: CloseNotifier,
    ) -> TransportResult<MockHandle> {
        if let Some(err) = upgrade.fail {
            return Err(err);
        }

        let mut log = self.log.lock().unwrap();
        log.notifiers.insert(upgrade.name.clone(), on_close);
        log.handlers.insert(upgrade.name.clone(), on_message);

        Ok(MockHandle {
            name: upgrade.name,
            log: Arc::clone(&self.log),
            fail_send: upgrade.fail_send,
        })
    }

    fn release(self) {
        self.log.lock().unwrap().factory_releases += 1;
    }
}

impl ConnectionHandle for MockHandle {
    fn send_text(&self, payload: &str) -> TransportResult<()> {
        if self.fail_send {
            return Err(TransportError::Closed);
        }
        self.log
            .lock()
            .unwrap()
            .sends
            .push((self.name.clone(), payload.to_string()));
        Ok(())
    }

    fn release(self) {
        let mut log = self.log.lock().unwrap();
        // Released connections never report closure.
        log.notifiers.remove(&self.name);
        log.handlers.remove(&self.name);
        log.releases.push(self.name);
    }
}

impl MockLog {
    /// Simulate the peer going away. Returns false if the connection is unknown.
    pub fn close_peer(&mut self, name: &str, reason: CloseReason) -> bool {
        match self.notifiers.remove(name) {
            Some(notifier) => {
                notifier.notify(reason);
                true
            }
            None => false,
        }
    }

    /// Simulate an inbound message
    pub fn deliver(&self, name: &str, message: Inbound) -> bool {
        match (self.handlers.get(name), self.notifiers.get(name)) {
            (Some(handler), Some(notifier)) => {
                handler(notifier.id(), message);
                true
            }
            _ => false,
        }
    }

    /// Names that received `payload`, sorted
    pub fn recipients(&self, payload: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .sends
            .iter()
            .filter(|(_, p)| p == payload)
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }
}
