//! Runtime configuration: environment variables first, then CLI flags
//! overriding them, with defaults matching the appliance's own factory
//! server address.

use std::net::{IpAddr, Ipv4Addr};

use clap::Parser;

/// Local gateway impersonating the Anova Precision Cooker cloud service.
#[derive(Parser, Debug)]
#[command(name = "anova-gateway")]
#[command(author, version, about = "Local gateway for Anova Precision Cooker Wi-Fi devices")]
pub struct Cli {
    /// Address the TCP server binds to for appliance connections
    #[arg(long, env = "server_host")]
    pub server_host: Option<IpAddr>,

    /// Port the TCP server listens on for appliance connections
    #[arg(long, env = "anova_server_port")]
    pub server_port: Option<u16>,

    /// Address the HTTP API binds to
    #[arg(long, env = "ANOVA_HTTP_HOST")]
    pub http_host: Option<IpAddr>,

    /// Port the HTTP API listens on
    #[arg(long, env = "ANOVA_HTTP_PORT")]
    pub http_port: Option<u16>,

    /// Directory of a built frontend to serve ahead of the API; unset disables it
    #[arg(long, env = "frontend_dist_dir")]
    pub frontend_dist_dir: Option<String>,

    /// Admin username required for admin-only routes from non-private callers
    #[arg(long, env = "admin_username")]
    pub admin_username: Option<String>,

    /// Admin password required for admin-only routes from non-private callers
    #[arg(long, env = "admin_password")]
    pub admin_password: Option<String>,

    /// Log verbosity filter, e.g. "info" or "anova_gateway=debug,anova_protocol=trace"
    #[arg(short, long, env = "ANOVA_LOG")]
    pub log: Option<String>,
}

/// Fully-resolved settings the rest of the gateway operates on.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server_host: IpAddr,
    pub server_port: u16,
    pub http_host: IpAddr,
    pub http_port: u16,
    pub frontend_dist_dir: Option<String>,
    pub admin_username: Option<String>,
    pub admin_password: Option<String>,
    pub log_filter: String,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            server_host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            server_port: 8080,
            http_host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            http_port: 8000,
            frontend_dist_dir: None,
            admin_username: None,
            admin_password: None,
            log_filter: "info".to_string(),
        }
    }
}

impl Settings {
    /// Build settings from parsed CLI/env args, falling back to defaults.
    pub fn from_cli(cli: Cli) -> Self {
        let defaults = Settings::default();
        Settings {
            server_host: cli.server_host.unwrap_or(defaults.server_host),
            server_port: cli.server_port.unwrap_or(defaults.server_port),
            http_host: cli.http_host.unwrap_or(defaults.http_host),
            http_port: cli.http_port.unwrap_or(defaults.http_port),
            frontend_dist_dir: cli.frontend_dist_dir,
            admin_username: cli.admin_username,
            admin_password: cli.admin_password,
            log_filter: cli.log.unwrap_or(defaults.log_filter),
        }
    }

    /// Whether admin credentials have been configured on the server at all.
    pub fn admin_credentials_configured(&self) -> bool {
        self.admin_username.is_some() && self.admin_password.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_factory_wifi_port() {
        assert_eq!(Settings::default().server_port, 8080);
    }

    #[test]
    fn missing_admin_credentials_detected() {
        let s = Settings::default();
        assert!(!s.admin_credentials_configured());
    }

    #[test]
    fn cli_overrides_win_over_defaults() {
        let cli = Cli {
            server_host: None,
            server_port: Some(9999),
            http_host: None,
            http_port: None,
            frontend_dist_dir: None,
            admin_username: None,
            admin_password: None,
            log: None,
        };
        let settings = Settings::from_cli(cli);
        assert_eq!(settings.server_port, 9999);
        assert_eq!(settings.http_port, 8000);
    }
}
