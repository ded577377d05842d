use std::env;
use std::sync::OnceLock;

static CONFIG: OnceLock<Config> = OnceLock::new();

// --- CONFIG AGGREGATOR ---

#[derive(Debug, Clone)]
pub struct Config {
    pub consumer: ConsumerDefaults,
    pub cluster: ClusterDefaults,
}

impl Config {
    pub fn global() -> &'static Config {
        CONFIG.get_or_init(Self::load)
    }

    fn load() -> Self {
        dotenv::dotenv().ok();
        Self {
            consumer: ConsumerDefaults::load(),
            cluster: ClusterDefaults::load(),
        }
    }
}

// --- MODULES ---

// CONSUMER
#[derive(Debug, Clone)]
pub struct ConsumerDefaults {
    pub ack_wait_ms: u64,
    pub max_ack_pending: usize,
    pub max_waiting: usize,
    pub ack_intake_capacity: usize,
    pub request_intake_capacity: usize,
    pub flow_control_max_bytes: usize,
    pub ephemeral_inactive_ms: u64,
    pub gateway_grace_ms: u64,
    pub ack_retry_ms: u64,
}

impl ConsumerDefaults {
    fn load() -> Self {
        Self {
            ack_wait_ms:              get_env("CONSUMER_ACK_WAIT_MS", "30000"),
            max_ack_pending:          get_env("CONSUMER_MAX_ACK_PENDING", "1000"),
            max_waiting:              get_env("CONSUMER_MAX_WAITING", "512"),
            ack_intake_capacity:      get_env("CONSUMER_ACK_INTAKE_CAP", "8192"),
            request_intake_capacity:  get_env("CONSUMER_REQUEST_INTAKE_CAP", "1024"),
            flow_control_max_bytes:   get_env("CONSUMER_FC_MAX_BYTES", "33554432"), // 32MiB
            ephemeral_inactive_ms:    get_env("CONSUMER_EPHEMERAL_INACTIVE_MS", "5000"),
            gateway_grace_ms:         get_env("CONSUMER_GATEWAY_GRACE_MS", "2000"),
            ack_retry_ms:             get_env("CONSUMER_ACK_RETRY_MS", "100"),
        }
    }
}

// CLUSTER
#[derive(Debug, Clone)]
pub struct ClusterDefaults {
    pub proposal_batch_max_bytes: usize,
    pub leaderless_reply_delay_ms: u64,
    pub delete_backoff_start_ms: u64,
    pub delete_backoff_cap_ms: u64,
}

impl ClusterDefaults {
    fn load() -> Self {
        Self {
            proposal_batch_max_bytes:  get_env("CLUSTER_PROPOSAL_BATCH_BYTES", "262144"), // 256KiB
            leaderless_reply_delay_ms: get_env("CLUSTER_LEADERLESS_DELAY_MS", "500"),
            delete_backoff_start_ms:   get_env("CLUSTER_DELETE_BACKOFF_START_MS", "30000"),
            delete_backoff_cap_ms:     get_env("CLUSTER_DELETE_BACKOFF_CAP_MS", "300000"),
        }
    }
}

// --- PRIVATE HELPER ---

fn get_env<T: std::str::FromStr>(key: &str, default: &str) -> T {
    env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .map_err(|_| format!("Config error: {} must be valid", key))
        .unwrap()
}
