//! Default value functions used by serde for config deserialization.

pub fn default_name() -> String {
    "wasend".to_string()
}

pub fn default_data_dir() -> String {
    "~/.wasend".to_string()
}

pub fn default_log_level() -> String {
    "info".to_string()
}

pub fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

pub fn default_api_port() -> u16 {
    4001
}

pub fn default_max_upload_bytes() -> usize {
    10 * 1024 * 1024
}

pub fn default_qr_timeout_secs() -> u64 {
    120
}

pub fn default_send_interval_ms() -> u64 {
    1000
}

pub fn default_dispatch_timeout_secs() -> u64 {
    600
}

pub fn default_device_name() -> String {
    "WASEND".to_string()
}
