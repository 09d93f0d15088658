#![no_main]
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &str| {
    // Parse and validation errors are fine; panics are not.
    if let Ok(cfg) = toml::from_str::<relay_config::Config>(data) {
        if cfg.validate().is_ok() {
            // A valid config always yields a usable client id and topic layout.
            assert!(!cfg.client_id().is_empty());
            let t = relay_core::Topics::new(&cfg.node.location, &cfg.node.id);
            assert_eq!(t.data.matches('/').count(), 3);
        }
    }
});
