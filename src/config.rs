use std::path::PathBuf;
use std::time::Duration;

use rand::distributions::Alphanumeric;
use rand::Rng;

use crate::error::EngineError;

/// Worker pool settings.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Number of concurrent workers. Zero disables the pool.
    pub worker_count: usize,
    /// Pause after a failed iteration before the next checkout.
    pub failure_pause: Duration,
    /// Path of the locking queue jobs are taken from.
    pub queue_path: String,
    /// How often a worker renews the checkout of the job it is running.
    /// Must be well below the queue's checkout timeout.
    pub lease_renewal: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            worker_count: 1,
            failure_pause: Duration::from_millis(100),
            queue_path: "/job".to_string(),
            lease_renewal: Duration::from_secs(15),
        }
    }
}

impl ExecutorConfig {
    pub fn with_worker_count(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count;
        self
    }

    pub fn with_failure_pause(mut self, failure_pause: Duration) -> Self {
        self.failure_pause = failure_pause;
        self
    }

    pub fn with_lease_renewal(mut self, lease_renewal: Duration) -> Self {
        self.lease_renewal = lease_renewal;
        self
    }
}

/// Settings for the distributor of one job type.
#[derive(Debug, Clone)]
pub struct DistributorConfig {
    pub job_type: String,
    /// Pause after a job could not be created.
    pub publish_failure_delay: Duration,
    /// Pause before restarting an exhausted generator or re-campaigning after
    /// an election error.
    pub restart_delay: Duration,
}

impl DistributorConfig {
    pub fn new(job_type: impl Into<String>) -> Self {
        Self {
            job_type: job_type.into(),
            publish_failure_delay: Duration::from_millis(100),
            restart_delay: Duration::from_secs(1),
        }
    }

    pub fn with_publish_failure_delay(mut self, delay: Duration) -> Self {
        self.publish_failure_delay = delay;
        self
    }

    pub fn with_restart_delay(mut self, delay: Duration) -> Self {
        self.restart_delay = delay;
        self
    }

    /// Election path the distributors of this job type compete on.
    pub fn election_path(&self) -> String {
        format!("/election/{}", self.job_type)
    }
}

/// Resource API connection settings.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub endpoint: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Skip TLS certificate verification.
    pub insecure: bool,
    pub request_timeout: Duration,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://nuv.la".to_string(),
            username: None,
            password: None,
            insecure: false,
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl ApiConfig {
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Username and password, when both are set.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        Some((self.username.as_deref()?, self.password.as_deref()?))
    }
}

/// Coordination provider settings.
#[derive(Debug, Clone)]
pub struct CoordinationConfig {
    /// ZooKeeper connection string (`host:port[,host:port...]`). The
    /// in-process provider is used when unset.
    pub zk_hosts: Option<String>,
    /// How long a checked-out queue item stays invisible without being
    /// renewed before it is handed to another consumer.
    pub checkout_timeout: Duration,
    /// How long a vanished participant keeps its election claim.
    pub session_timeout: Duration,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            zk_hosts: None,
            checkout_timeout: Duration::from_secs(60),
            session_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`.
    pub filter: String,
    /// Directory for daily rolling log files. Console only when unset.
    pub log_dir: Option<PathBuf>,
    /// File name prefix of the rolling log files.
    pub file_prefix: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            log_dir: None,
            file_prefix: "job-engine.log".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Base name of this process, used for election participation and
    /// worker names.
    pub name: String,
    pub executor: ExecutorConfig,
    pub distributors: Vec<DistributorConfig>,
    pub api: ApiConfig,
    pub coordination: CoordinationConfig,
    pub logging: LoggingConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            name: random_name(),
            executor: ExecutorConfig::default(),
            distributors: Vec::new(),
            api: ApiConfig::default(),
            coordination: CoordinationConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_distributor(mut self, distributor: DistributorConfig) -> Self {
        self.distributors.push(distributor);
        self
    }

    /// Rejects configurations that cannot start.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.name.trim().is_empty() {
            return Err(EngineError::Config("process name must not be empty".into()));
        }
        if self.executor.worker_count == 0 && self.distributors.is_empty() {
            return Err(EngineError::Config(
                "nothing to run: no workers and no distributors".into(),
            ));
        }
        if self.api.credentials().is_none() {
            return Err(EngineError::Config(
                "API username and password are required".into(),
            ));
        }

        if self.executor.worker_count > 0
            && (self.executor.lease_renewal.is_zero()
                || self.executor.lease_renewal >= self.coordination.checkout_timeout)
        {
            return Err(EngineError::Config(format!(
                "lease renewal ({:?}) must be non-zero and shorter than the checkout timeout ({:?})",
                self.executor.lease_renewal, self.coordination.checkout_timeout
            )));
        }

        let mut seen = std::collections::HashSet::new();
        for distributor in &self.distributors {
            if !seen.insert(distributor.job_type.as_str()) {
                return Err(EngineError::Config(format!(
                    "job type {} is distributed twice",
                    distributor.job_type
                )));
            }
        }
        Ok(())
    }
}

/// Random process name, used when none is given.
pub fn random_name() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect();
    format!("job-engine-{}", suffix.to_lowercase())
}
