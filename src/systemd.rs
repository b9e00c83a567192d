use serde::{Deserialize, Serialize};
use tracing::info;

use crate::container::Workload;
use crate::error::Result;
use crate::shell::{Cmd, Script};
use crate::ssh::{ExecOptions, RemoteExecutor};

const UNIT_DIR: &str = "/etc/systemd/system";

/// Append `.service` unless the name already has a unit suffix.
#[must_use]
pub fn normalize_unit_name(unit: &str) -> String {
    let trimmed = unit.trim();
    if trimmed.is_empty() || trimmed.contains('.') {
        return trimmed.to_string();
    }
    format!("{trimmed}.service")
}

#[must_use]
pub fn unit_path(unit: &str) -> String {
    format!("{UNIT_DIR}/{}", normalize_unit_name(unit))
}

/// Quote one word of an `Exec*=` line.
fn systemd_word(value: &str) -> String {
    let needs_quotes = value.is_empty()
        || value
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '"' | '\'' | '\\' | ';'));
    let escaped = value.replace('%', "%%");
    if !needs_quotes {
        return escaped;
    }
    let mut out = String::with_capacity(escaped.len() + 2);
    out.push('"');
    for ch in escaped.chars() {
        if matches!(ch, '"' | '\\') {
            out.push('\\');
        }
        out.push(ch);
    }
    out.push('"');
    out
}

fn exec_line(cmd: &Cmd) -> String {
    let mut words = vec!["/usr/bin/env".to_string(), systemd_word(cmd.program())];
    words.extend(cmd.arguments().iter().map(|a| systemd_word(a)));
    words.join(" ")
}

/// Unit that keeps the workload running across reboots.
#[must_use]
pub fn render_unit(w: &Workload) -> String {
    let service = if w.manifest.is_compose() {
        let up = w.compose_cmd().args(["up", "-d", "--remove-orphans"]);
        let down = w.compose_cmd().arg("down");
        format!(
            "\
Type=oneshot
RemainAfterExit=yes
WorkingDirectory={dir}
ExecStart={up}
ExecStop={down}
",
            dir = systemd_word(&w.src_dir()),
            up = exec_line(&up),
            down = exec_line(&down),
        )
    } else {
        let start = Cmd::new("docker").args(["start", "-a", w.app.as_str()]);
        let stop = Cmd::new("docker").args(["stop", "-t", "10", w.app.as_str()]);
        format!(
            "\
Restart=always
RestartSec=5
ExecStart={start}
ExecStop={stop}
",
            start = exec_line(&start),
            stop = exec_line(&stop),
        )
    };

    format!(
        "\
[Unit]
Description={app} (deployed by trebuchet)
After=network-online.target docker.service
Requires=docker.service
Wants=network-online.target

[Service]
{service}
[Install]
WantedBy=multi-user.target
",
        app = w.app,
    )
}

/// Commands [`install`] issues, for display.
#[must_use]
pub fn actions(unit: &str) -> Vec<String> {
    vec![
        format!("write {}", unit_path(unit)),
        enable_script(unit).render(),
    ]
}

fn enable_script(unit: &str) -> Script {
    let unit = normalize_unit_name(unit);
    Script::new(Cmd::new("systemctl").arg("daemon-reload"))
        .and(Cmd::new("systemctl").args(["enable", "--now", unit.as_str()]))
}

/// Install and enable the unit. Rewrites it only when it changed.
pub fn install(remote: &dyn RemoteExecutor, unit: &str, w: &Workload) -> Result<()> {
    let path = unit_path(unit);
    let content = render_unit(w);
    let current = remote.query(Script::new(Cmd::new("cat").arg(&path)))?;

    if current.as_deref() == Some(content.trim_end()) {
        info!(unit = %path, "service unit unchanged");
    } else {
        remote.write_file(content.as_bytes(), &path)?;
        info!(unit = %path, "service unit written");
    }
    remote.run(enable_script(unit), &ExecOptions::install())?;
    Ok(())
}

/// The unit as it was before [`install`] touched it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitRecord {
    pub name: String,
    /// `None` when the unit did not exist.
    pub previous: Option<String>,
}

pub fn capture(remote: &dyn RemoteExecutor, unit: &str) -> Result<UnitRecord> {
    let name = normalize_unit_name(unit);
    let previous = remote.query(Script::new(Cmd::new("cat").arg(unit_path(&name))))?;
    Ok(UnitRecord { name, previous })
}

/// Put the recorded unit back: rewrite the old content, or stop,
/// disable and delete a unit that did not exist before.
pub fn restore(remote: &dyn RemoteExecutor, record: &UnitRecord) -> Result<()> {
    let path = unit_path(&record.name);
    let reload = Cmd::new("systemctl").arg("daemon-reload");
    match &record.previous {
        Some(content) => {
            remote.write_file(format!("{content}\n").as_bytes(), &path)?;
            remote.run(Script::new(reload), &ExecOptions::install())?;
        }
        None => {
            let script = Script::new(
                Cmd::new("systemctl").args(["disable", "--now", record.name.as_str()]),
            )
            .or_true()
            .and(Cmd::new("rm").args(["-f", path.as_str()]))
            .and(reload);
            remote.run(script, &ExecOptions::install())?;
        }
    }
    info!(unit = %record.name, "service unit restored");
    Ok(())
}
