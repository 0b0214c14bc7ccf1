//! Podman CLI build service.

use std::io::Write as _;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command as TokioCommand;
use tokio::sync::OnceCell;
use tracing::{debug, info, instrument, warn};

use super::{BuildService, ImageRef};
use crate::error::{BuildError, BuildResult};
use crate::process::{run_captured, CapturedOutput};

/// Time limit for short podman queries (info, exists, rmi, prune).
const QUERY_TIMEOUT: Duration = Duration::from_secs(60);

/// Platform used when `podman info` cannot be read.
const FALLBACK_PLATFORM: &str = "linux/amd64";

/// Build service backend type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildServiceType {
    /// Podman CLI.
    #[default]
    Podman,
    /// In-memory mock for testing.
    Mock,
}

/// Build service configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct BuildServiceConfig {
    /// Backend type.
    #[serde(default)]
    pub service_type: BuildServiceType,

    /// Path or name of the podman binary.
    #[serde(default = "default_binary")]
    pub binary: String,

    /// Image repository function images are tagged into.
    #[serde(default = "default_repository")]
    pub repository: String,

    /// Target platform such as `linux/arm64`. Detected from the host if unset.
    pub platform: Option<String>,

    /// Containerfile template. `{bootstrap}` is replaced with the bootstrap
    /// binary name.
    #[serde(default = "default_containerfile")]
    pub containerfile: String,

    /// Name of the bootstrap binary the image runs.
    #[serde(default = "default_bootstrap_name")]
    pub bootstrap_name: String,

    /// Build timeout in seconds.
    #[serde(default = "default_build_timeout_secs")]
    pub timeout_secs: u64,

    /// Disable the layer cache.
    #[serde(default)]
    pub no_cache: bool,
}

fn default_binary() -> String {
    "podman".to_owned()
}

fn default_repository() -> String {
    "localhost/cirrus-functions".to_owned()
}

fn default_containerfile() -> String {
    r#"FROM docker.io/library/rust:1-slim AS build
WORKDIR /src
COPY . .
RUN cargo build --release --bin {bootstrap}

FROM gcr.io/distroless/cc-debian12
COPY --from=build /src/target/release/{bootstrap} /function
ENTRYPOINT ["/function"]
"#
    .to_owned()
}

fn default_bootstrap_name() -> String {
    "cirrus-bootstrap".to_owned()
}

const fn default_build_timeout_secs() -> u64 {
    900
}

impl Default for BuildServiceConfig {
    fn default() -> Self {
        Self {
            service_type: BuildServiceType::default(),
            binary: default_binary(),
            repository: default_repository(),
            platform: None,
            containerfile: default_containerfile(),
            bootstrap_name: default_bootstrap_name(),
            timeout_secs: default_build_timeout_secs(),
            no_cache: false,
        }
    }
}

impl BuildServiceConfig {
    /// Build timeout as a duration.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Containerfile text with the bootstrap name substituted.
    #[must_use]
    pub fn render_containerfile(&self) -> String {
        self.containerfile.replace("{bootstrap}", &self.bootstrap_name)
    }
}

/// Build service backed by the `podman` CLI.
#[derive(Debug)]
pub struct PodmanBuildService {
    config: BuildServiceConfig,
    platform: OnceCell<String>,
}

impl PodmanBuildService {
    /// Create a new Podman build service.
    #[must_use]
    pub fn new(config: BuildServiceConfig) -> Self {
        Self {
            config,
            platform: OnceCell::new(),
        }
    }

    fn command(&self) -> TokioCommand {
        TokioCommand::new(&self.config.binary)
    }

    async fn query(&self, args: &[&str]) -> BuildResult<CapturedOutput> {
        let mut cmd = self.command();
        cmd.args(args);
        let output = run_captured(cmd, None, QUERY_TIMEOUT)
            .await
            .map_err(|e| BuildError::BuildService(format!("failed to run {}: {e}", self.config.binary)))?;
        if output.timed_out {
            return Err(BuildError::BuildService(format!(
                "{} {} timed out",
                self.config.binary,
                args.join(" ")
            )));
        }
        Ok(output)
    }

    /// The build platform, from configuration or `podman info`.
    async fn platform(&self) -> &str {
        self.platform
            .get_or_init(|| async {
                if let Some(platform) = &self.config.platform {
                    return platform.clone();
                }
                match self
                    .query(&["info", "--format", "{{.Host.OS}}/{{.Host.Arch}}"])
                    .await
                {
                    Ok(output) if output.success() => match output.stdout.first() {
                        Some(line) if !line.trim().is_empty() => {
                            let platform = line.trim().to_owned();
                            info!(platform = %platform, "detected build platform");
                            platform
                        }
                        _ => FALLBACK_PLATFORM.to_owned(),
                    },
                    Ok(output) => {
                        warn!(stderr = %output.stderr_text(), "podman info failed, using fallback platform");
                        FALLBACK_PLATFORM.to_owned()
                    }
                    Err(e) => {
                        warn!(error = %e, "podman info failed, using fallback platform");
                        FALLBACK_PLATFORM.to_owned()
                    }
                }
            })
            .await
    }
}

#[async_trait]
impl BuildService for PodmanBuildService {
    #[instrument(skip(self, source_dir), fields(tag = %tag))]
    async fn build(&self, source_dir: &Path, tag: &str) -> BuildResult<ImageRef> {
        let image = self.image_ref(tag);
        let platform = self.platform().await.to_owned();

        // The containerfile lives outside the build context so it never ends
        // up in the stored source.
        let mut containerfile = tempfile::Builder::new()
            .prefix("cirrus-containerfile-")
            .tempfile()?;
        containerfile.write_all(self.config.render_containerfile().as_bytes())?;
        containerfile.flush()?;

        let mut cmd = self.command();
        cmd.arg("build")
            .arg("--platform")
            .arg(&platform)
            .arg("--tag")
            .arg(&image.reference)
            .arg("--file")
            .arg(containerfile.path())
            .arg("--rm");
        if self.config.no_cache {
            cmd.arg("--no-cache");
        }
        cmd.arg(source_dir);

        info!(reference = %image.reference, platform = %platform, "starting image build");

        let output = run_captured(cmd, None, self.config.timeout())
            .await
            .map_err(|e| BuildError::BuildService(format!("failed to spawn {}: {e}", self.config.binary)))?;

        if output.timed_out {
            return Err(BuildError::Timeout {
                limit: self.config.timeout(),
            });
        }
        if !output.success() {
            return Err(BuildError::BuildFailed {
                tag: tag.to_owned(),
                exit_code: output.exit_code.unwrap_or(-1),
                stderr: output.stderr_text(),
            });
        }

        info!(
            reference = %image.reference,
            duration_secs = output.duration.as_secs_f32(),
            "image build complete"
        );
        Ok(image)
    }

    async fn image_exists(&self, tag: &str) -> BuildResult<bool> {
        let reference = self.image_ref(tag).reference;
        let output = self.query(&["image", "exists", &reference]).await?;
        match output.exit_code {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            code => Err(BuildError::BuildService(format!(
                "podman image exists returned {code:?}: {}",
                output.stderr_text()
            ))),
        }
    }

    async fn remove_image(&self, tag: &str) -> BuildResult<()> {
        let reference = self.image_ref(tag).reference;
        let output = self.query(&["rmi", "--force", "--ignore", &reference]).await?;
        if !output.success() {
            return Err(BuildError::BuildService(format!(
                "failed to remove {reference}: {}",
                output.stderr_text()
            )));
        }
        debug!(reference = %reference, "image removed");
        Ok(())
    }

    async fn prune_dangling(&self) -> BuildResult<()> {
        let output = self.query(&["image", "prune", "--force"]).await?;
        if !output.success() {
            return Err(BuildError::BuildService(format!(
                "image prune failed: {}",
                output.stderr_text()
            )));
        }
        debug!(removed = output.stdout.len(), "pruned dangling images");
        Ok(())
    }

    fn image_ref(&self, tag: &str) -> ImageRef {
        ImageRef {
            tag: tag.to_owned(),
            reference: format!("{}:{tag}", self.config.repository),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config = BuildServiceConfig::default();
        assert_eq!(config.service_type, BuildServiceType::Podman);
        assert_eq!(config.binary, "podman");
        assert_eq!(config.timeout(), Duration::from_secs(900));
        assert!(!config.no_cache);
    }

    #[test]
    fn containerfile_substitutes_bootstrap() {
        let config = BuildServiceConfig {
            bootstrap_name: "entry".to_owned(),
            ..BuildServiceConfig::default()
        };
        let rendered = config.render_containerfile();
        assert!(rendered.contains("--bin entry"));
        assert!(rendered.contains("/src/target/release/entry"));
        assert!(!rendered.contains("{bootstrap}"));
    }

    #[test]
    fn image_reference_uses_repository() {
        let service = PodmanBuildService::new(BuildServiceConfig::default());
        let image = service.image_ref("01abc-v2");
        assert_eq!(image.reference, "localhost/cirrus-functions:01abc-v2");
    }

    #[tokio::test]
    async fn configured_platform_skips_detection() {
        let service = PodmanBuildService::new(BuildServiceConfig {
            binary: "/nonexistent/podman".to_owned(),
            platform: Some("linux/arm64".to_owned()),
            ..BuildServiceConfig::default()
        });
        assert_eq!(service.platform().await, "linux/arm64");
    }

    #[tokio::test]
    async fn missing_binary_falls_back_to_default_platform() {
        let service = PodmanBuildService::new(BuildServiceConfig {
            binary: "/nonexistent/podman".to_owned(),
            ..BuildServiceConfig::default()
        });
        assert_eq!(service.platform().await, FALLBACK_PLATFORM);
    }

    #[tokio::test]
    async fn missing_binary_is_a_service_error() {
        let service = PodmanBuildService::new(BuildServiceConfig {
            binary: "/nonexistent/podman".to_owned(),
            ..BuildServiceConfig::default()
        });
        let err = service.image_exists("t").await.unwrap_err();
        assert!(matches!(err, BuildError::BuildService(_)));
    }
}
