use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

/// Scheduling knobs shared by the broker and every job supervisor.
#[derive(Debug, Clone)]
pub struct SchedulingConfig {
    /// Workers a new job asks for until told otherwise.
    pub default_desired_workers: usize,
    /// Base wait between demand attempts while a job is short of workers.
    pub demand_retry_interval_ms: u64,
    /// Upper bound of the random jitter added to each wait.
    pub demand_retry_jitter_ms: u64,
    /// Consecutive zero-worker attempts before a job is failed.
    pub max_demand_attempts: u32,
    /// Finished job snapshots kept around for status queries.
    pub finished_history: usize,
    /// Largest frame range a job may span. Larger records fail the job.
    pub max_frames_per_job: usize,
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        Self {
            default_desired_workers: 1,
            demand_retry_interval_ms: 20_000,
            demand_retry_jitter_ms: 2_000,
            max_demand_attempts: 30,
            finished_history: 1_000,
            max_frames_per_job: 100_000,
        }
    }
}

/// Where scenes and rendered frames live.
///
/// When a service URL is `None` the node falls back to the in-memory
/// collaborator, which is what local runs and the test suite use.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Base URL of the blob service (e.g. `http://127.0.0.1:13000`).
    pub blob_service_url: Option<String>,
    /// Base URL of the document service (e.g. `http://127.0.0.1:12000`).
    pub document_service_url: Option<String>,
    /// Bucket workers upload finished frames into.
    pub upload_bucket: String,
    /// Bucket holding the final per-customer, per-job frames.
    pub output_bucket: String,
    /// Scenes preloaded into the in-memory document store.
    pub scenes: Vec<SceneSeed>,
    /// Limit on any single call to a storage service, including each
    /// rendered-frame move and the job record load.
    pub request_timeout_ms: u64,
}

/// A renderable scene known to the in-memory document store, written as
/// `customer:object:locator:first-last`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SceneSeed {
    pub customer_id: String,
    pub object_id: String,
    pub scene_locator: String,
    pub first_frame: u32,
    pub last_frame: u32,
}

impl FromStr for SceneSeed {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || format!("expected customer:object:locator:first-last, got '{s}'");
        let (head, range) = s.rsplit_once(':').ok_or_else(malformed)?;
        let parts: Vec<&str> = head.splitn(3, ':').collect();
        let [customer_id, object_id, scene_locator] = parts.as_slice() else {
            return Err(malformed());
        };
        let (first, last) = range
            .split_once('-')
            .ok_or_else(|| format!("frame range '{range}' is not first-last"))?;
        let first_frame = first
            .parse()
            .map_err(|e| format!("bad first frame '{first}': {e}"))?;
        let last_frame = last
            .parse()
            .map_err(|e| format!("bad last frame '{last}': {e}"))?;
        Ok(Self {
            customer_id: customer_id.to_string(),
            object_id: object_id.to_string(),
            scene_locator: scene_locator.to_string(),
            first_frame,
            last_frame,
        })
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            blob_service_url: None,
            document_service_url: None,
            upload_bucket: "rendered-frames-upload".to_string(),
            output_bucket: "rendered-frames".to_string(),
            scenes: Vec::new(),
            request_timeout_ms: 30_000,
        }
    }
}

impl StorageConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Clone)]
pub struct FarmConfig {
    pub listen_addr: SocketAddr,
    pub scheduling: SchedulingConfig,
    pub storage: StorageConfig,
}

impl Default for FarmConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 7500)),
            scheduling: SchedulingConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

impl FarmConfig {
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            ..Default::default()
        }
    }

    pub fn with_scheduling(mut self, scheduling: SchedulingConfig) -> Self {
        self.scheduling = scheduling;
        self
    }

    pub fn with_storage(mut self, storage: StorageConfig) -> Self {
        self.storage = storage;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheduling_config_default() {
        let cfg = SchedulingConfig::default();
        assert_eq!(cfg.default_desired_workers, 1);
        assert_eq!(cfg.demand_retry_interval_ms, 20_000);
        assert_eq!(cfg.max_demand_attempts, 30);
        assert_eq!(cfg.max_frames_per_job, 100_000);
    }

    #[test]
    fn storage_config_default_is_in_memory() {
        let cfg = StorageConfig::default();
        assert!(cfg.blob_service_url.is_none());
        assert!(cfg.document_service_url.is_none());
        assert_ne!(cfg.upload_bucket, cfg.output_bucket);
        assert_eq!(cfg.request_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn scene_seed_parses() {
        let seed: SceneSeed = "acme:intro:scenes/intro.blend:1-250".parse().unwrap();
        assert_eq!(seed.customer_id, "acme");
        assert_eq!(seed.object_id, "intro");
        assert_eq!(seed.scene_locator, "scenes/intro.blend");
        assert_eq!((seed.first_frame, seed.last_frame), (1, 250));

        let url: SceneSeed = "acme:intro:s3://bucket/intro.blend:5-6".parse().unwrap();
        assert_eq!(url.scene_locator, "s3://bucket/intro.blend");
    }

    #[test]
    fn scene_seed_rejects_malformed_input() {
        assert!("acme:intro:1-250".parse::<SceneSeed>().is_err());
        assert!("acme:intro:s.blend:250".parse::<SceneSeed>().is_err());
        assert!("acme:intro:s.blend:a-b".parse::<SceneSeed>().is_err());
    }

    #[test]
    fn farm_config_default() {
        let cfg = FarmConfig::default();
        assert_eq!(cfg.listen_addr.to_string(), "127.0.0.1:7500");
        assert_eq!(cfg.scheduling.finished_history, 1_000);
    }

    #[test]
    fn farm_config_builders() {
        let addr: SocketAddr = "10.0.0.1:9000".parse().unwrap();
        let cfg = FarmConfig::new(addr)
            .with_scheduling(SchedulingConfig {
                max_demand_attempts: 3,
                ..Default::default()
            })
            .with_storage(StorageConfig {
                blob_service_url: Some("http://blob:13000".to_string()),
                ..Default::default()
            });
        assert_eq!(cfg.listen_addr, addr);
        assert_eq!(cfg.scheduling.max_demand_attempts, 3);
        assert_eq!(
            cfg.storage.blob_service_url.as_deref(),
            Some("http://blob:13000")
        );
    }
}
