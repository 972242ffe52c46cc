use clap::Args;
use std::env;
use std::path::PathBuf;

pub const ROOT_ENV: &str = "CALLIGRAPHY_ROOT";
pub const BUCKET_ENV: &str = "CALLIGRAPHY_BUCKET";
pub const PUBLIC_URL_ENV: &str = "CALLIGRAPHY_PUBLIC_URL";

const DEFAULT_BUCKET: &str = "calligraphy";

#[derive(Args, Debug, Clone, Default)]
pub struct StorageArgs {
    /// Directory holding bucket directories (env: CALLIGRAPHY_ROOT, default: .)
    #[arg(long, global = true)]
    pub root: Option<PathBuf>,
    /// Bucket name (env: CALLIGRAPHY_BUCKET, default: calligraphy)
    #[arg(long, global = true)]
    pub bucket: Option<String>,
    /// Base URL that public image addresses are built from (env: CALLIGRAPHY_PUBLIC_URL)
    #[arg(long, global = true)]
    pub public_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub root: PathBuf,
    pub bucket: String,
    pub public_url: Option<String>,
}

impl Settings {
    /// Flags win over environment variables, which win over defaults.
    pub fn resolve(args: &StorageArgs) -> Self {
        Self::resolve_with(args, |key| env::var(key).ok())
    }

    fn resolve_with(args: &StorageArgs, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let from_env = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        Self {
            root: args
                .root
                .clone()
                .or_else(|| from_env(ROOT_ENV).map(PathBuf::from))
                .unwrap_or_else(|| PathBuf::from(".")),
            bucket: args
                .bucket
                .clone()
                .or_else(|| from_env(BUCKET_ENV))
                .unwrap_or_else(|| DEFAULT_BUCKET.to_string()),
            public_url: args.public_url.clone().or_else(|| from_env(PUBLIC_URL_ENV)),
        }
    }
}
