use std::env;

/// §6.5 Configuration (environment). Layered env-override-with-default,
/// following the pack's `DaemonConfig` convention.
#[derive(Debug, Clone)]
pub struct Config {
    pub master_key_hex: Option<String>,
    pub max_concurrent_migrations: u64,
    pub directory_host: String,
    pub target_pds_host: Option<String>,
    pub deployment_mode: DeploymentMode,
    pub invite_code_mode: InviteCodeMode,
    pub work_root: String,
    pub database_url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeploymentMode {
    Standalone,
    Bound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InviteCodeMode {
    Required,
    Optional,
    Hidden,
}

const DEFAULT_MAX_CONCURRENT_MIGRATIONS: u64 = 15;
const DEFAULT_DIRECTORY_HOST: &str = "https://plc.directory";
const DEFAULT_WORK_ROOT: &str = "/var/lib/migration-orchestrator/work";

impl Config {
    pub fn from_env() -> Self {
        Self {
            master_key_hex: env::var("MASTER_KEY").ok(),
            max_concurrent_migrations: env::var("MAX_CONCURRENT_MIGRATIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_MAX_CONCURRENT_MIGRATIONS),
            directory_host: env::var("DIRECTORY_HOST")
                .unwrap_or_else(|_| DEFAULT_DIRECTORY_HOST.to_string()),
            target_pds_host: env::var("TARGET_PDS_HOST").ok(),
            deployment_mode: match env::var("DEPLOYMENT_MODE").as_deref() {
                Ok("bound") => DeploymentMode::Bound,
                _ => DeploymentMode::Standalone,
            },
            invite_code_mode: match env::var("INVITE_CODE_MODE").as_deref() {
                Ok("required") => InviteCodeMode::Required,
                Ok("hidden") => InviteCodeMode::Hidden,
                _ => InviteCodeMode::Optional,
            },
            work_root: env::var("MIGRATION_WORK_ROOT")
                .unwrap_or_else(|_| DEFAULT_WORK_ROOT.to_string()),
            database_url: env::var("DATABASE_URL").ok(),
        }
    }

    pub fn is_production(&self) -> bool {
        env::var("ENVIRONMENT")
            .map(|v| v.eq_ignore_ascii_case("production"))
            .unwrap_or(false)
    }
}
