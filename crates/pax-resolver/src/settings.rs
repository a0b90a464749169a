use std::path::PathBuf;

/// Network knobs forwarded to pip.
///
/// Pip runs isolated from user configuration, so anything the environment
/// would normally supply (proxies, private index auth, internal CAs) must be
/// passed through explicitly.
#[derive(Clone, Debug, Default)]
pub struct NetworkSettings {
    pub proxy: Option<String>,
    pub cert: Option<PathBuf>,
    pub client_cert: Option<PathBuf>,
    pub trusted_hosts: Vec<String>,
}

/// Typed configuration for one resolve run.
#[derive(Clone, Debug)]
pub struct ResolverSettings {
    /// Upper bound on concurrently running subprocesses. `None` asks for the
    /// CPU-count default.
    pub max_jobs: Option<usize>,
    /// Primary package index. `None` leaves pip's default in place.
    pub index_url: Option<String>,
    pub extra_index_urls: Vec<String>,
    pub find_links: Vec<String>,
    /// Permit building sdists when no wheel matches.
    pub allow_builds: bool,
    /// Permit pre-built wheels at all (hermetic rebuilds disable this).
    pub allow_wheels: bool,
    pub network: NetworkSettings,
}

impl Default for ResolverSettings {
    fn default() -> Self {
        Self {
            max_jobs: None,
            index_url: None,
            extra_index_urls: Vec::new(),
            find_links: Vec::new(),
            allow_builds: true,
            allow_wheels: true,
            network: NetworkSettings::default(),
        }
    }
}
