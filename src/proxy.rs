use std::fmt::Write as _;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{DeployError, Result};
use crate::shell::{Cmd, Script};
use crate::ssh::{ExecOptions, RemoteExecutor};

/// An nginx server block forwarding to the application.
///
/// # Example
///
/// ```
/// use trebuchet::proxy::NginxSite;
///
/// let site = NginxSite::new("shop", 8080)
///     .server_name("shop.example.com")
///     .max_body_size("32m");
///
/// let conf = site.render();
/// assert!(conf.contains("server_name shop.example.com;"));
/// assert!(conf.contains("proxy_pass http://127.0.0.1:8080;"));
/// ```
#[derive(Debug, Clone)]
pub struct NginxSite {
    pub app: String,
    pub upstream_port: u16,
    pub server_name: Option<String>,
    pub max_body_size: String,
}

impl NginxSite {
    #[must_use]
    pub fn new(app: &str, upstream_port: u16) -> Self {
        Self {
            app: app.to_string(),
            upstream_port,
            server_name: None,
            max_body_size: "64m".to_string(),
        }
    }

    #[must_use]
    pub fn server_name(mut self, name: &str) -> Self {
        self.server_name = Some(name.to_string());
        self
    }

    #[must_use]
    pub fn max_body_size(mut self, size: &str) -> Self {
        self.max_body_size = size.to_string();
        self
    }

    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::new();
        let server_name = self.server_name.as_deref().unwrap_or("_");
        let _ = writeln!(out, "# Managed by trebuchet for {}.", self.app);
        out.push_str("server {\n");
        out.push_str("    listen 80;\n");
        out.push_str("    listen [::]:80;\n");
        let _ = writeln!(out, "    server_name {server_name};");
        let _ = writeln!(out, "    client_max_body_size {};", self.max_body_size);
        out.push('\n');
        out.push_str("    location / {\n");
        let _ = writeln!(
            out,
            "        proxy_pass http://127.0.0.1:{};",
            self.upstream_port
        );
        for line in [
            "proxy_http_version 1.1;",
            "proxy_set_header Host $host;",
            "proxy_set_header X-Real-IP $remote_addr;",
            "proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;",
            "proxy_set_header X-Forwarded-Proto $scheme;",
            "proxy_set_header Upgrade $http_upgrade;",
            "proxy_set_header Connection \"upgrade\";",
            "proxy_read_timeout 60s;",
        ] {
            let _ = writeln!(out, "        {line}");
        }
        out.push_str("    }\n");
        out.push_str("}\n");
        out
    }
}

/// Where a distribution expects site configs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NginxLayout {
    /// Debian: `sites-available` plus a symlink in `sites-enabled`.
    SitesEnabled,
    /// RHEL, Alpine: `conf.d`.
    ConfD,
}

impl NginxLayout {
    pub fn detect(remote: &dyn RemoteExecutor) -> Result<Self> {
        let debian = remote.check(Script::new(
            Cmd::new("test").args(["-d", "/etc/nginx/sites-enabled"]),
        ))?;
        Ok(if debian { Self::SitesEnabled } else { Self::ConfD })
    }

    #[must_use]
    pub fn config_path(self, app: &str) -> String {
        match self {
            Self::SitesEnabled => format!("/etc/nginx/sites-available/{app}.conf"),
            Self::ConfD => format!("/etc/nginx/conf.d/{app}.conf"),
        }
    }

    #[must_use]
    pub fn enabled_link(self, app: &str) -> Option<String> {
        match self {
            Self::SitesEnabled => Some(format!("/etc/nginx/sites-enabled/{app}.conf")),
            Self::ConfD => None,
        }
    }

    #[must_use]
    pub const fn default_site(self) -> &'static str {
        match self {
            Self::SitesEnabled => "/etc/nginx/sites-enabled/default",
            Self::ConfD => "/etc/nginx/conf.d/default.conf",
        }
    }
}

/// The distribution's default site, as it was before we removed it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefaultSite {
    pub path: String,
    /// Set when the site was a symlink.
    pub link_target: Option<String>,
    /// Set when the site was a plain file.
    pub content: Option<String>,
}

/// Record the default site so a rollback can put it back. Kept in
/// memory rather than copied aside: nginx loads every file in
/// `sites-enabled`.
pub fn capture_default_site(
    remote: &dyn RemoteExecutor,
    layout: NginxLayout,
) -> Result<Option<DefaultSite>> {
    let path = layout.default_site();
    if remote.check(Script::new(Cmd::new("test").args(["-L", path])))? {
        let target = remote.query(Script::new(Cmd::new("readlink").arg(path)))?;
        return Ok(target.map(|target| DefaultSite {
            path: path.to_string(),
            link_target: Some(target),
            content: None,
        }));
    }
    let content = remote.query(Script::new(Cmd::new("cat").arg(path)))?;
    Ok(content.map(|content| DefaultSite {
        path: path.to_string(),
        link_target: None,
        content: Some(content),
    }))
}

fn recreate_default_site(remote: &dyn RemoteExecutor, site: &DefaultSite) -> Result<()> {
    if let Some(target) = &site.link_target {
        remote.run(link_script(target, &site.path), &ExecOptions::default())?;
    } else if let Some(content) = &site.content {
        remote.write_file(format!("{content}\n").as_bytes(), &site.path)?;
    }
    info!(path = %site.path, "default nginx site restored");
    Ok(())
}

/// Where the previous config of `path` is kept while a deployment runs.
#[must_use]
pub fn backup_path(path: &str) -> String {
    format!("{path}.trebuchet-previous")
}

/// Copy the live config aside. Returns whether there was one.
pub fn backup(remote: &dyn RemoteExecutor, path: &str) -> Result<bool> {
    let exists = remote.check(Script::new(Cmd::new("test").args(["-f", path])))?;
    if exists {
        remote.run(
            Script::new(Cmd::new("cp").args(["-p", path, &backup_path(path)])),
            &ExecOptions::default(),
        )?;
    }
    Ok(exists)
}

fn reload_script() -> Script {
    Script::new(Cmd::new("systemctl").args(["reload", "nginx"]))
        .or(Cmd::new("nginx").args(["-s", "reload"]))
}

fn test_script() -> Script {
    Script::new(Cmd::new("nginx").arg("-t"))
}

/// Installed proxy config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyInstall {
    pub config_path: String,
    pub enabled_link: Option<String>,
    pub warnings: Vec<String>,
}

/// Commands [`configure`] issues, for display.
#[must_use]
pub fn actions(site: &NginxSite, layout: NginxLayout) -> Vec<String> {
    let path = layout.config_path(&site.app);
    let mut actions = vec![format!("write {path}")];
    if let Some(link) = layout.enabled_link(&site.app) {
        actions.push(link_script(&path, &link).render());
    }
    actions.push(test_script().render());
    actions.push(reload_script().render());
    actions
}

fn link_script(path: &str, link: &str) -> Script {
    Script::new(Cmd::new("ln").args(["-sf", path, link]))
}

/// Install `site`, validate with `nginx -t` and reload.
///
/// An invalid config is rolled back to what was there before and
/// reported as an error; nginx keeps serving the old config.
pub fn configure(
    remote: &dyn RemoteExecutor,
    site: &NginxSite,
    layout: NginxLayout,
) -> Result<ProxyInstall> {
    let path = layout.config_path(&site.app);
    let link = layout.enabled_link(&site.app);
    let content = site.render();
    let mut warnings = Vec::new();

    let current = remote.query(Script::new(Cmd::new("cat").arg(&path)))?;
    let had_backup = remote.check(Script::new(Cmd::new("test").args(["-f", &backup_path(&path)])))?;
    let linked = match &link {
        Some(link) => remote.check(Script::new(Cmd::new("test").args(["-L", link])))?,
        None => true,
    };
    if current.as_deref() == Some(content.trim_end()) && linked {
        info!(path = %path, "proxy config unchanged");
        return Ok(ProxyInstall {
            config_path: path,
            enabled_link: link,
            warnings,
        });
    }

    remote.write_file(content.as_bytes(), &path)?;
    if let Some(link) = &link {
        remote.run(link_script(&path, link), &ExecOptions::default())?;
    }

    let default_site = layout.default_site();
    let removal = remote.run(
        Script::new(Cmd::new("rm").args(["-f", default_site])),
        &ExecOptions::default(),
    );
    if let Err(e) = removal {
        warnings.push(format!(
            "could not remove default nginx site {default_site}: {e}"
        ));
    }

    if let Err(e) = remote.run(test_script(), &ExecOptions::default()) {
        warn!(path = %path, "nginx rejected the new config, restoring");
        restore(remote, &path, link.as_deref(), had_backup, None)?;
        return Err(e);
    }
    remote.run(reload_script(), &ExecOptions::default())?;
    info!(path = %path, "proxy configured");

    Ok(ProxyInstall {
        config_path: path,
        enabled_link: link,
        warnings,
    })
}

/// Put the previous config back and reload.
///
/// With `had_previous`, the backup is moved into place unless a
/// failed [`configure`] already did so. Without it, our config and
/// link are removed. A recorded `default_site` is recreated.
pub fn restore(
    remote: &dyn RemoteExecutor,
    path: &str,
    link: Option<&str>,
    had_previous: bool,
    default_site: Option<&DefaultSite>,
) -> Result<()> {
    let backup = backup_path(path);
    if had_previous {
        let pending = remote.check(Script::new(Cmd::new("test").args(["-f", &backup])))?;
        if pending {
            remote.run(
                Script::new(Cmd::new("mv").args(["-f", &backup, path])),
                &ExecOptions::default(),
            )?;
        }
    } else {
        let remove = Script::new(Cmd::new("rm").args(["-f", path]));
        let script = match link {
            Some(link) => remove.and(Cmd::new("rm").args(["-f", link])),
            None => remove,
        };
        remote.run(script, &ExecOptions::default())?;
    }
    if let Some(site) = default_site {
        recreate_default_site(remote, site)?;
    }

    remote
        .run(test_script(), &ExecOptions::default())
        .map_err(|e| DeployError::Rollback(format!("nginx config invalid after restore: {e}")))?;
    remote.run(reload_script(), &ExecOptions::default())?;
    Ok(())
}
