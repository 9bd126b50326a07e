pub const fn project_name() -> &'static str {
    "cmt-load-test"
}

pub const fn network_service_identifier() -> &'static str {
    concat!("cmt-load-test/", env!("CARGO_PKG_VERSION"))
}

/// Name a worker advertises to the coordinator when none was given.
pub fn default_worker_name() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(|| format!("worker-{}", std::process::id()))
}
