//! Transport parameters and engine configuration.

use serde_derive::{Deserialize, Serialize};

pub const INIT_STRM_DATA_BIDI: u64 = 0x4_0000;
pub const INIT_STRM_DATA_UNI: u64 = 0x1_0000;
pub const INIT_MAX_BIDI_STREAMS: i64 = 8;
pub const INIT_MAX_UNI_STREAMS: i64 = 4;

/// Default ACK delay exponent; INITIAL and HANDSHAKE packets always use it.
pub const DEF_ACK_DEL_EXP: u8 = 3;

pub const K_IDLE_TIMEOUT_SECS: u64 = 10;
pub const K_DELAYED_ACK_MSECS: u64 = 25;
pub const K_MIGRATION_LOCKOUT_SECS: u64 = 3;

/// One direction's transport parameters, plus the pending window values that will be advertised
/// by the next MAX_DATA / MAX_STREAM_ID frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportParams {
    pub max_data: u64,
    pub max_strm_data_bidi_local: u64,
    pub max_strm_data_bidi_remote: u64,
    pub max_strm_data_uni: u64,
    pub max_bidi_streams: i64,
    pub max_uni_streams: i64,
    pub idle_to: u64,
    pub ack_del_exp: u8,
    pub max_ack_del: u64,
    pub disable_migration: bool,

    #[serde(skip)]
    pub new_max_data: u64,
    #[serde(skip)]
    pub new_max_bidi_streams: i64,
    #[serde(skip)]
    pub new_max_uni_streams: i64,
}

impl Default for TransportParams {
    fn default() -> TransportParams {
        TransportParams {
            max_data: INIT_MAX_BIDI_STREAMS as u64 * INIT_STRM_DATA_BIDI,
            max_strm_data_bidi_local: INIT_STRM_DATA_BIDI,
            max_strm_data_bidi_remote: INIT_STRM_DATA_BIDI,
            max_strm_data_uni: INIT_STRM_DATA_UNI,
            max_bidi_streams: INIT_MAX_BIDI_STREAMS,
            max_uni_streams: INIT_MAX_UNI_STREAMS,
            idle_to: K_IDLE_TIMEOUT_SECS,
            ack_del_exp: DEF_ACK_DEL_EXP,
            max_ack_del: K_DELAYED_ACK_MSECS,
            disable_migration: false,
            new_max_data: 0,
            new_max_bidi_streams: 0,
            new_max_uni_streams: 0,
        }
    }
}

impl TransportParams {
    /// Parameters advertised to a peer before its real values arrive. The peer's limits are
    /// unknown at that point, so everything starts at zero except what the draft guarantees.
    pub fn unknown_peer() -> TransportParams {
        TransportParams {
            max_data: 0,
            max_strm_data_bidi_local: 0,
            max_strm_data_bidi_remote: 0,
            max_strm_data_uni: 0,
            max_bidi_streams: 0,
            max_uni_streams: 0,
            ..TransportParams::default()
        }
    }
}

/// Engine-wide tuning, loadable from TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Number of packet buffers to preallocate.
    pub nbufs: usize,
    pub idle_timeout_secs: u64,
    /// Challenge new clients with a stateless retry before accepting them.
    pub do_retry: bool,
    /// TOML logging section handed to the logger builder; empty uses the default terminal
    /// logger.
    pub logging: String,
    pub tp: TransportParams,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            nbufs: 4096,
            idle_timeout_secs: K_IDLE_TIMEOUT_SECS,
            do_retry: false,
            logging: String::new(),
            tp: TransportParams::default(),
        }
    }
}

impl Config {
    pub fn from_toml(toml: &str) -> Result<Config, String> {
        serdeconv::from_toml_str(toml).map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_consistent() {
        let tp = TransportParams::default();
        assert_eq!(tp.max_data, tp.max_bidi_streams as u64 * tp.max_strm_data_bidi_local);
        assert_eq!(tp.ack_del_exp, DEF_ACK_DEL_EXP);
    }

    #[test]
    fn test_config_from_toml_overrides() {
        let config = Config::from_toml(
            r#"
nbufs = 128
idle_timeout_secs = 30
"#,
        )
        .unwrap();

        assert_eq!(config.nbufs, 128);
        assert_eq!(config.idle_timeout_secs, 30);
        assert_eq!(config.tp.max_bidi_streams, INIT_MAX_BIDI_STREAMS);
    }

    #[test]
    fn test_config_rejects_malformed_toml() {
        assert!(Config::from_toml("nbufs = \"many\"").is_err());
    }
}
