use once_cell::sync::Lazy;
use prometheus::{IntCounter, IntGauge, register_int_counter, register_int_gauge};

pub static EVENT_COUNT: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "informer_events_total",
        "Informer number of watch events dispatched"
    )
    .unwrap()
});

pub static REGISTER_COUNT: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "informer_register_total",
        "Informer number of watch registrations"
    )
    .unwrap()
});

pub static UNREGISTER_COUNT: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "informer_unregister_total",
        "Informer number of watch unregistrations"
    )
    .unwrap()
});

pub static CONTEXT_CACHE_SIZE: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!("context_cache_size", "Number of cached contexts").unwrap()
});

pub static SESSION_CACHE_SIZE: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!("session_cache_size", "Number of cached sessions").unwrap()
});
