//! Mapping from the validated configuration to protocol engine settings.

use kestrel_config::{ConfigError, EngineConfig};
use kestrel_torrent_core::{ObfuscationPolicy, ProtocolSettings};

/// Derive construction settings for the protocol engine.
pub(crate) fn protocol_settings(config: &EngineConfig) -> Result<ProtocolSettings, ConfigError> {
    let incoming_port = config
        .listen_port()
        .ok_or_else(|| ConfigError::InvalidField {
            field: "incoming_port",
            value: Some(config.incoming_port.to_string()),
            reason: "must be between 1 and 65535",
        })?;

    Ok(ProtocolSettings {
        incoming_port,
        download_root: config.download_directory.clone(),
        use_mmap: config.use_mmap,
        enable_upload: config.enable_upload,
        enable_seeding: config.enable_seeding,
        upload_rate_limit: config.upload_rate,
        download_rate_limit: config.download_rate,
        proxy_url: config
            .proxy_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .map(str::to_string),
        obfuscation: ObfuscationPolicy {
            preferred: config.obfs_preferred,
            require_preferred: config.obfs_require_preferred,
        },
        disable_utp: config.disable_utp,
        disable_ipv6: config.disable_ipv6,
        disable_trackers: config.disable_trackers,
        no_default_port_forwarding: config.no_default_port_forwarding,
        mute_engine_log: config.mute_engine_log,
        engine_debug: config.engine_debug,
        established_conns_per_task: config.established_conns_per_task,
        half_open_conns_per_task: config.half_open_conns_per_task,
        total_half_open_conns: config.total_half_open_conns,
    })
}
