use std::{fs, time::Duration};

use anyhow::{Context, Error};
use config::{builder::DefaultState, Config, ConfigBuilder};

#[derive(Debug, serde_derive::Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AppConfig {
    pub listen_address: String,
    pub cloud: CloudClientParameters,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0:3000".to_string(),
            cloud: CloudClientParameters::default(),
        }
    }
}

/// Parameters of one cloud profile. The three required values stay optional
/// here: the client reports their absence as its configuration error.
#[derive(Clone, Debug, serde_derive::Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CloudClientParameters {
    pub publish_settings: Option<String>,
    pub publish_settings_path: Option<String>,
    pub subscription_id: Option<String>,
    pub vm_names: Option<String>,
    pub image_name: String,
    pub agent_vm_name_param: String,
    pub agent_image_param: String,
    pub status_wait_timeout_secs: u64,
    pub operation_poll_interval_secs: u64,
}

impl Default for CloudClientParameters {
    fn default() -> Self {
        Self {
            publish_settings: None,
            publish_settings_path: None,
            subscription_id: None,
            vm_names: None,
            image_name: "Azure VMs".to_string(),
            agent_vm_name_param: "azure.vm.name".to_string(),
            agent_image_param: "azure.image".to_string(),
            status_wait_timeout_secs: 15 * 60,
            operation_poll_interval_secs: 5,
        }
    }
}

impl CloudClientParameters {
    pub fn status_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.status_wait_timeout_secs)
    }

    pub fn operation_poll_interval(&self) -> Duration {
        Duration::from_secs(self.operation_poll_interval_secs)
    }

    fn resolve_publish_settings_file(&mut self) -> Result<(), Error> {
        if self.publish_settings.is_some() {
            return Ok(());
        }
        if let Some(path) = self.publish_settings_path.as_ref() {
            let content = fs::read_to_string(path)
                .with_context(|| format!("Can't read publish settings file {}", path))?;
            self.publish_settings = Some(content);
        }
        Ok(())
    }
}

/// Loads `vmpool.toml` (optional) overridden by `VMPOOL_*` environment
/// variables, nested keys separated by `__` (`VMPOOL_CLOUD__VM_NAMES`).
pub fn load_config() -> Result<AppConfig, Error> {
    let builder = Config::builder()
        .add_source(config::File::with_name("vmpool").required(false))
        .add_source(
            config::Environment::with_prefix("vmpool")
                .prefix_separator("_")
                .separator("__"),
        );
    build_config(builder)
}

fn build_config(builder: ConfigBuilder<DefaultState>) -> Result<AppConfig, Error> {
    let config = builder.build().context("Can't load configuration")?;

    let mut app_config: AppConfig = config
        .try_deserialize()
        .context("Can't deserialize AppConfig from loaded configuration")?;
    app_config.cloud.resolve_publish_settings_file()?;
    Ok(app_config)
}

#[cfg(test)]
mod tests {
    use config::FileFormat;

    use super::*;

    fn from_toml(toml: &str) -> Result<AppConfig, Error> {
        build_config(Config::builder().add_source(config::File::from_str(toml, FileFormat::Toml)))
    }

    #[test]
    fn defaults_apply_to_empty_configuration() {
        let config = from_toml("").unwrap();

        assert_eq!(config, AppConfig::default());
        assert_eq!(config.cloud.status_wait_timeout(), Duration::from_secs(900));
        assert_eq!(config.cloud.image_name, "Azure VMs");
        assert!(config.cloud.vm_names.is_none());
    }

    #[test]
    fn reads_cloud_parameters() {
        let config = from_toml(
            r#"
listen_address = "127.0.0.1:8080"

[cloud]
subscription_id = "sub-1"
vm_names = """
vm-a
vm-b
"""
status_wait_timeout_secs = 60
"#,
        )
        .unwrap();

        assert_eq!(config.listen_address, "127.0.0.1:8080");
        assert_eq!(config.cloud.subscription_id.as_deref(), Some("sub-1"));
        assert_eq!(config.cloud.vm_names.as_deref(), Some("vm-a\nvm-b\n"));
        assert_eq!(config.cloud.status_wait_timeout(), Duration::from_secs(60));
        assert_eq!(config.cloud.operation_poll_interval(), Duration::from_secs(5));
    }

    #[test]
    fn missing_publish_settings_file_fails() {
        let error = from_toml(
            r#"
[cloud]
publish_settings_path = "/nonexistent/vmpool.publishsettings"
"#,
        )
        .unwrap_err();

        assert!(error.to_string().contains("Can't read publish settings file"));
    }
}
