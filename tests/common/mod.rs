#![allow(dead_code, missing_docs, clippy::unwrap_used)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use secret_fs::fetch::{FetchError, SecretSource};

/// What the mock answers for one path.
#[derive(Clone, Debug)]
pub enum MockAnswer {
    Content(&'static [u8]),
    /// Behaves like a command that printed something and then exited nonzero.
    Fail,
}

/// A scripted secret source that records every path it is asked for.
///
/// Answers are consumed per path in order; the last answer for a path repeats forever. Paths
/// with no answer fail.
#[derive(Clone, Default)]
pub struct MockSource {
    answers: Arc<Mutex<HashMap<String, Vec<MockAnswer>>>>,
    pub fetched: Arc<Mutex<Vec<String>>>,
    delay: Option<Duration>,
}

impl MockSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, path: &str, answer: MockAnswer) -> Self {
        self.answers
            .lock()
            .unwrap()
            .entry(path.to_owned())
            .or_default()
            .push(answer);
        self
    }

    /// Sleep this long inside every fetch, to widen race windows.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn fetched_paths(&self) -> Vec<String> {
        self.fetched.lock().unwrap().clone()
    }

    pub fn fetch_count(&self) -> usize {
        self.fetched.lock().unwrap().len()
    }
}

#[async_trait]
impl SecretSource for MockSource {
    async fn fetch(&self, path: &str) -> Result<Bytes, FetchError> {
        self.fetched.lock().unwrap().push(path.to_owned());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let answer = {
            let mut answers = self.answers.lock().unwrap();
            match answers.get_mut(path) {
                Some(queue) if queue.len() > 1 => Some(queue.remove(0)),
                Some(queue) => queue.first().cloned(),
                None => None,
            }
        };

        match answer {
            Some(MockAnswer::Content(bytes)) => Ok(Bytes::from_static(bytes)),
            Some(MockAnswer::Fail) | None => Err(FetchError::Io(std::io::Error::other(
                "mock command exited unsuccessfully",
            ))),
        }
    }
}

/// A source whose content is derived from the path, so any mix-up is detectable.
#[derive(Clone, Default)]
pub struct EchoSource {
    pub fetches: Arc<Mutex<usize>>,
}

#[async_trait]
impl SecretSource for EchoSource {
    async fn fetch(&self, path: &str) -> Result<Bytes, FetchError> {
        *self.fetches.lock().unwrap() += 1;
        tokio::time::sleep(Duration::from_millis(1)).await;
        Ok(Bytes::from(format!("secret for {path}")))
    }
}

/// A command source running `sh -c <body>`. The script sees `get` as `$1` and the path as `$2`.
pub fn shell_source(body: &str) -> secret_fs::fetch::CommandSource {
    secret_fs::fetch::CommandSource::new("sh").with_args(["-c", body, "sh"])
}
