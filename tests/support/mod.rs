//! An in-memory Linux host for driving deployments without SSH.
//!
//! [`FakeHost`] interprets the commands the crate issues (coreutils,
//! package managers, systemctl, nginx, docker, compose) against a
//! small model of the machine, so tests can assert on the resulting
//! state instead of on command strings.

#![allow(dead_code)]

use std::cell::{Cell, Ref, RefCell, RefMut};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tempfile::TempDir;
use trebuchet::config::Credential;
use trebuchet::container::PROJECT_LABEL;
use trebuchet::error::{DeployError, Result};
use trebuchet::health::HealthPolicy;
use trebuchet::pipeline::{AbortSignal, Pipeline};
use trebuchet::provision::Provisioner;
use trebuchet::repo::SourceStage;
use trebuchet::shell::{Cmd, Connector, Script};
use trebuchet::ssh::{ExecOptions, ExecOutput, RemoteExecutor, RemoteTarget};
use trebuchet::transfer::FileTransfer;
use trebuchet::{DeploymentConfig, ValidConfig};

type Out = (i32, String, String);

fn ok() -> Out {
    (0, String::new(), String::new())
}

fn ok_out(stdout: impl Into<String>) -> Out {
    (0, stdout.into(), String::new())
}

fn fail(code: i32, stderr: impl Into<String>) -> Out {
    (code, String::new(), stderr.into())
}

/// Always available, whatever is installed.
const BUILTINS: [&str; 13] = [
    "true", "false", "command", "test", "mkdir", "rm", "mv", "cp", "cat", "touch", "chmod", "ln",
    "readlink",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Container {
    pub id: String,
    pub name: String,
    pub image: String,
    pub running: bool,
    pub port: Option<u16>,
    pub project: Option<String>,
    pub service: Option<String>,
}

#[derive(Debug)]
pub struct HostState {
    pub binaries: BTreeSet<String>,
    /// Installed under `/usr/sbin`: only found by root or through sudo.
    pub sbin: BTreeSet<String>,
    /// systemd units and whether they are active.
    pub units: BTreeMap<String, bool>,
    pub docker_running: bool,
    pub compose_plugin: bool,
    pub files: BTreeMap<String, String>,
    pub dirs: BTreeSet<String>,
    pub links: BTreeMap<String, String>,
    pub modes: BTreeMap<String, String>,
    pub containers: Vec<Container>,
    /// Image tag to image id.
    pub images: BTreeMap<String, String>,
    /// HTTP status an image answers with; `None` never answers.
    pub image_http: BTreeMap<String, Option<u16>>,
    /// Status given to the next images built.
    pub build_http: Option<u16>,
    /// Services of the compose project being deployed.
    pub compose_services: Vec<String>,
    pub compose_port: u16,
    /// `nginx -t` fails while an enabled config contains this.
    pub nginx_rejects: Option<String>,
    /// Statuses handed out to health requests before the modelled one;
    /// `None` is a request that gets no answer.
    pub http_replies: VecDeque<Option<u16>>,
    privileged: bool,
    next_id: u32,
}

impl HostState {
    fn bare() -> Self {
        let mut state = Self {
            binaries: ["apt-get", "systemctl", "pgrep", "setsid", "sh", "tar"]
                .into_iter()
                .map(ToString::to_string)
                .collect(),
            sbin: BTreeSet::new(),
            units: BTreeMap::new(),
            docker_running: false,
            compose_plugin: false,
            files: BTreeMap::new(),
            dirs: BTreeSet::new(),
            links: BTreeMap::new(),
            modes: BTreeMap::new(),
            containers: Vec::new(),
            images: BTreeMap::new(),
            image_http: BTreeMap::new(),
            build_http: Some(200),
            compose_services: Vec::new(),
            compose_port: 8080,
            nginx_rejects: None,
            http_replies: VecDeque::new(),
            privileged: true,
            next_id: 0,
        };
        for dir in ["/tmp", "/opt", "/etc/systemd/system"] {
            state.add_dir_all(dir);
        }
        state
    }

    fn new_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}{:012x}", self.next_id)
    }

    fn add_dir_all(&mut self, path: &str) {
        for ancestor in Path::new(path).ancestors() {
            let dir = ancestor.display().to_string();
            if !dir.is_empty() {
                self.dirs.insert(dir);
            }
        }
    }

    pub fn install_docker(&mut self) {
        self.binaries.insert("docker".into());
        self.units.insert("docker.service".into(), true);
        self.docker_running = true;
        self.compose_plugin = true;
    }

    pub fn install_nginx(&mut self) {
        self.binaries.insert("nginx".into());
        self.sbin.insert("nginx".into());
        self.units.insert("nginx.service".into(), true);
        self.add_dir_all("/etc/nginx/sites-available");
        self.add_dir_all("/etc/nginx/sites-enabled");
        self.add_dir_all("/etc/nginx/conf.d");
        self.files.insert(
            "/etc/nginx/sites-available/default".into(),
            "server { listen 80 default_server; }\n".into(),
        );
        self.links.insert(
            "/etc/nginx/sites-enabled/default".into(),
            "/etc/nginx/sites-available/default".into(),
        );
    }

    fn on_path(&self, program: &str) -> bool {
        BUILTINS.contains(&program)
            || (self.binaries.contains(program) && (self.privileged || !self.sbin.contains(program)))
    }

    fn exec(&mut self, program: &str, args: &[&str]) -> Out {
        if !self.on_path(program) {
            return fail(127, format!("sh: {program}: not found"));
        }
        match program {
            "true" => ok(),
            "false" => fail(1, ""),
            "command" => self.command_v(args),
            "test" => self.test(args),
            "mkdir" => self.mkdir(args),
            "rm" => self.rm(args),
            "mv" => self.mv(args),
            "cp" => self.cp(args),
            "cat" => self.cat(args),
            "touch" => {
                for path in operands(args) {
                    self.files.entry(path.to_string()).or_default();
                }
                ok()
            }
            "chmod" => match operands(args).as_slice() {
                [mode, path] if self.files.contains_key(*path) => {
                    self.modes.insert((*path).to_string(), (*mode).to_string());
                    ok()
                }
                _ => fail(1, "chmod: cannot access"),
            },
            "ln" => match operands(args).as_slice() {
                [target, link] => {
                    self.links.insert((*link).to_string(), (*target).to_string());
                    ok()
                }
                _ => fail(1, "ln: missing operand"),
            },
            "readlink" => match operands(args).as_slice() {
                [path] => match self.links.get(*path) {
                    Some(target) => ok_out(target.clone()),
                    None => fail(1, ""),
                },
                _ => fail(1, "readlink: missing operand"),
            },
            "tar" => ok(),
            "curl" => self.curl(args),
            "sh" => self.sh(args),
            "apt-get" | "dnf" | "yum" | "apk" => self.package(args),
            "systemctl" => self.systemctl(args),
            "pgrep" => {
                if args.last() == Some(&"nginx") && self.nginx_active() {
                    ok_out("1234")
                } else {
                    fail(1, "")
                }
            }
            "setsid" => {
                if args.contains(&"dockerd") && self.binaries.contains("docker") {
                    self.docker_running = true;
                    ok()
                } else {
                    fail(1, "setsid: failed to execute")
                }
            }
            "nginx" => self.nginx(args),
            "docker" => self.docker(args),
            "docker-compose" => self.compose(args),
            other => fail(127, format!("sh: {other}: not found")),
        }
    }

    fn command_v(&self, args: &[&str]) -> Out {
        match args {
            ["-v", binary] if self.on_path(binary) => {
                let dir = if self.sbin.contains(*binary) { "sbin" } else { "bin" };
                ok_out(format!("/usr/{dir}/{binary}"))
            }
            _ => fail(1, ""),
        }
    }

    fn test(&self, args: &[&str]) -> Out {
        let found = match args {
            ["-d", path] => self.dirs.contains(*path),
            ["-f", path] => self.files.contains_key(*path),
            ["-L", path] => self.links.contains_key(*path),
            ["-e", path] => {
                self.dirs.contains(*path)
                    || self.files.contains_key(*path)
                    || self.links.contains_key(*path)
            }
            _ => false,
        };
        if found { ok() } else { fail(1, "") }
    }

    fn mkdir(&mut self, args: &[&str]) -> Out {
        let parents = args.contains(&"-p");
        for path in operands(args) {
            if parents {
                self.add_dir_all(path);
            } else if self.dirs.contains(path) || self.files.contains_key(path) {
                return fail(1, format!("mkdir: cannot create directory '{path}': File exists"));
            } else {
                self.dirs.insert(path.to_string());
            }
        }
        ok()
    }

    fn rm(&mut self, args: &[&str]) -> Out {
        let recursive = args.iter().any(|a| a.starts_with('-') && a.contains('r'));
        for path in operands(args) {
            self.files.remove(path);
            self.links.remove(path);
            if recursive && self.dirs.contains(path) {
                let prefix = format!("{path}/");
                self.dirs.retain(|d| d != path && !d.starts_with(&prefix));
                self.files.retain(|f, _| !f.starts_with(&prefix));
                self.links.retain(|l, _| !l.starts_with(&prefix));
            }
        }
        ok()
    }

    fn mv(&mut self, args: &[&str]) -> Out {
        let ops = operands(args);
        let &[src, dst] = ops.as_slice() else {
            return fail(1, "mv: missing operand");
        };
        if let Some(content) = self.files.remove(src) {
            self.files.insert(dst.to_string(), content);
            return ok();
        }
        if !self.dirs.contains(src) {
            return fail(1, format!("mv: cannot stat '{src}': No such file or directory"));
        }
        let prefix = format!("{src}/");
        let rename = |p: &str| format!("{dst}{}", &p[src.len()..]);
        let dirs: Vec<String> = self
            .dirs
            .iter()
            .filter(|d| *d == src || d.starts_with(&prefix))
            .cloned()
            .collect();
        for dir in dirs {
            self.dirs.remove(&dir);
            self.dirs.insert(rename(&dir));
        }
        let files: Vec<String> = self
            .files
            .keys()
            .filter(|f| f.starts_with(&prefix))
            .cloned()
            .collect();
        for file in files {
            if let Some(content) = self.files.remove(&file) {
                self.files.insert(rename(&file), content);
            }
        }
        ok()
    }

    fn cp(&mut self, args: &[&str]) -> Out {
        let ops = operands(args);
        let &[src, dst] = ops.as_slice() else {
            return fail(1, "cp: missing operand");
        };
        match self.files.get(src).cloned() {
            Some(content) => {
                self.files.insert(dst.to_string(), content);
                ok()
            }
            None => fail(1, format!("cp: cannot stat '{src}'")),
        }
    }

    fn cat(&self, args: &[&str]) -> Out {
        let ops = operands(args);
        let &[path] = ops.as_slice() else {
            return fail(1, "cat: missing operand");
        };
        match self.files.get(path) {
            Some(content) => ok_out(content.clone()),
            None => fail(1, format!("cat: {path}: No such file or directory")),
        }
    }

    fn curl(&mut self, args: &[&str]) -> Out {
        if args.contains(&"-fsSL") {
            self.files
                .insert("/tmp/get-docker.sh".into(), "#!/bin/sh\n".into());
            return ok();
        }
        let Some(url) = args.iter().find(|a| a.starts_with("http://")) else {
            return fail(3, "curl: no URL specified");
        };
        let status = self
            .http_replies
            .pop_front()
            .unwrap_or_else(|| self.http_status(url));
        match status {
            Some(code) => ok_out(code.to_string()),
            None => (7, "000".into(), String::new()),
        }
    }

    fn http_status(&self, url: &str) -> Option<u16> {
        let rest = url.strip_prefix("http://127.0.0.1")?;
        let port = match rest.strip_prefix(':') {
            Some(with_port) => with_port
                .split('/')
                .next()
                .and_then(|p| p.parse().ok())?,
            None => 80,
        };
        if port != 80 {
            return self.app_status(port);
        }
        if !self.nginx_active() {
            return None;
        }
        let upstream = self.enabled_configs().into_iter().find_map(|content| {
            let (_, after) = content.split_once("proxy_pass http://127.0.0.1:")?;
            after.split(';').next()?.parse::<u16>().ok()
        })?;
        Some(self.app_status(upstream).unwrap_or(502))
    }

    fn app_status(&self, port: u16) -> Option<u16> {
        let container = self
            .containers
            .iter()
            .find(|c| c.running && c.port == Some(port))?;
        self.image_http
            .get(&container.image)
            .copied()
            .unwrap_or(Some(200))
    }

    fn enabled_configs(&self) -> Vec<String> {
        let mut configs: Vec<String> = self
            .files
            .iter()
            .filter(|(path, _)| {
                path.starts_with("/etc/nginx/conf.d/") && path.ends_with(".conf")
            })
            .map(|(_, content)| content.clone())
            .collect();
        for target in self.links.values() {
            if let Some(content) = self.files.get(target) {
                configs.push(content.clone());
            }
        }
        configs
    }

    fn sh(&mut self, args: &[&str]) -> Out {
        match args {
            ["/tmp/get-docker.sh"] if self.files.contains_key("/tmp/get-docker.sh") => {
                self.install_docker();
                ok()
            }
            _ => fail(2, "sh: cannot open"),
        }
    }

    fn package(&mut self, args: &[&str]) -> Out {
        let Some(sub) = args.iter().position(|a| *a == "install" || *a == "add") else {
            return ok();
        };
        for package in args[sub + 1..].iter().filter(|a| !a.starts_with('-')) {
            match *package {
                "curl" => {
                    self.binaries.insert("curl".into());
                }
                "nginx" => self.install_nginx(),
                "docker" => self.install_docker(),
                "docker-compose-plugin" | "docker-cli-compose" => self.compose_plugin = true,
                other => return fail(100, format!("E: Unable to locate package {other}")),
            }
        }
        ok()
    }

    fn unit_known(&self, unit: &str) -> bool {
        self.units.contains_key(unit)
            || self.files.contains_key(&format!("/etc/systemd/system/{unit}"))
    }

    fn start_unit(&mut self, unit: &str) -> Out {
        if !self.unit_known(unit) {
            return fail(5, format!("Failed to start {unit}: Unit {unit} not found."));
        }
        self.units.insert(unit.to_string(), true);
        if unit == "docker.service" {
            self.docker_running = true;
        }
        ok()
    }

    fn systemctl(&mut self, args: &[&str]) -> Out {
        let Some(unit) = args.last().copied() else {
            return fail(1, "");
        };
        match args.first().copied() {
            Some("is-active") => {
                if self.units.get(unit) == Some(&true) { ok() } else { fail(3, "") }
            }
            Some("cat") => {
                if self.unit_known(unit) { ok() } else { fail(1, "No files found") }
            }
            Some("enable") if args.contains(&"--now") => self.start_unit(unit),
            Some("disable") => {
                if !self.unit_known(unit) {
                    return fail(1, format!("Failed to disable unit: Unit file {unit} does not exist."));
                }
                if args.contains(&"--now") {
                    self.units.remove(unit);
                }
                ok()
            }
            Some("start") => self.start_unit(unit),
            Some("reload") => {
                let unit = format!("{unit}.service");
                if self.units.get(&unit) == Some(&true) { ok() } else { fail(1, "not active") }
            }
            _ => ok(),
        }
    }

    fn nginx_active(&self) -> bool {
        self.units.get("nginx.service") == Some(&true)
    }

    fn nginx(&mut self, args: &[&str]) -> Out {
        match args {
            [] => {
                self.units.insert("nginx.service".into(), true);
                ok()
            }
            ["-t"] => {
                let rejected = self.nginx_rejects.as_ref().is_some_and(|needle| {
                    self.enabled_configs().iter().any(|c| c.contains(needle.as_str()))
                });
                if rejected {
                    fail(1, "nginx: configuration file /etc/nginx/nginx.conf test failed")
                } else {
                    ok()
                }
            }
            ["-s", "reload"] if self.nginx_active() => ok(),
            _ => fail(1, "nginx: unexpected arguments"),
        }
    }

    fn resolve_image(&self, reference: &str) -> Option<String> {
        self.images.get(reference).cloned().or_else(|| {
            self.images
                .values()
                .any(|id| id == reference)
                .then(|| reference.to_string())
        })
    }

    fn container_mut(&mut self, name: &str) -> Option<&mut Container> {
        self.containers
            .iter_mut()
            .find(|c| c.name == name || c.id == name)
    }

    fn build_image(&mut self, tag: &str) -> String {
        let id = self.new_id("sha256:");
        self.images.insert(tag.to_string(), id.clone());
        self.image_http.insert(id.clone(), self.build_http);
        id
    }

    fn docker(&mut self, args: &[&str]) -> Out {
        if args.first() == Some(&"compose") {
            if !self.compose_plugin {
                return fail(1, "docker: 'compose' is not a docker command.");
            }
            return self.compose(&args[1..]);
        }
        if !self.docker_running {
            return fail(1, "Cannot connect to the Docker daemon at unix:///var/run/docker.sock");
        }
        match args {
            ["info"] => ok_out("Server Version: 27.0.0"),
            ["build", rest @ ..] => {
                let Some(tag) = value_of(rest, "-t") else {
                    return fail(1, "build needs a tag");
                };
                self.build_image(tag);
                ok()
            }
            ["run", rest @ ..] => self.docker_run(rest),
            ["container", "inspect", "--format", format, target] => self.inspect(format, target),
            ["tag", source, tag] => match self.resolve_image(source) {
                Some(id) => {
                    self.images.insert((*tag).to_string(), id);
                    ok()
                }
                None => fail(1, format!("Error response from daemon: No such image: {source}")),
            },
            ["rm", "-f", name] => {
                let before = self.containers.len();
                self.containers.retain(|c| c.name != *name && c.id != *name);
                if self.containers.len() < before {
                    ok()
                } else {
                    fail(1, format!("Error: No such container: {name}"))
                }
            }
            ["stop", name] | ["stop", "-t", _, name] => match self.container_mut(name) {
                Some(c) => {
                    c.running = false;
                    ok()
                }
                None => fail(1, format!("Error: No such container: {name}")),
            },
            ["start", name] => match self.container_mut(name) {
                Some(c) => {
                    c.running = true;
                    ok()
                }
                None => fail(1, format!("Error: No such container: {name}")),
            },
            ["rename", old, new] => {
                if self.containers.iter().any(|c| c.name == *new) {
                    return fail(1, format!("Conflict. The container name \"/{new}\" is already in use"));
                }
                match self.container_mut(old) {
                    Some(c) => {
                        c.name = (*new).to_string();
                        ok()
                    }
                    None => fail(1, format!("Error: No such container: {old}")),
                }
            }
            ["ps", rest @ ..] => self.ps(rest),
            _ => fail(1, format!("docker: unsupported invocation {args:?}")),
        }
    }

    fn docker_run(&mut self, args: &[&str]) -> Out {
        let Some(name) = value_of(args, "--name") else {
            return fail(1, "run needs a name");
        };
        let port = value_of(args, "-p")
            .and_then(|p| p.split(':').next())
            .and_then(|p| p.parse().ok());
        let Some(image) = args.last().and_then(|i| self.resolve_image(i)) else {
            return fail(125, "Unable to find image");
        };
        if self.containers.iter().any(|c| c.name == name) {
            return fail(125, format!("Conflict. The container name \"/{name}\" is already in use"));
        }
        let id = self.new_id("c");
        self.containers.push(Container {
            id: id.clone(),
            name: name.to_string(),
            image,
            running: true,
            port,
            project: None,
            service: None,
        });
        ok_out(id)
    }

    fn inspect(&self, format: &str, target: &str) -> Out {
        let Some(c) = self
            .containers
            .iter()
            .find(|c| c.name == target || c.id == target)
        else {
            return fail(1, format!("Error: No such container: {target}"));
        };
        match format {
            "{{.Id}}" => ok_out(c.id.clone()),
            "{{.Image}}" => ok_out(c.image.clone()),
            "{{.State.Running}}" => ok_out(c.running.to_string()),
            f if f.starts_with("{{index .Config.Labels") => ok_out(format!(
                "{} {}",
                c.service.clone().unwrap_or_default(),
                c.image
            )),
            _ => fail(1, "unsupported format"),
        }
    }

    fn ps(&self, args: &[&str]) -> Out {
        let project = args
            .iter()
            .find_map(|a| a.strip_prefix(&format!("label={PROJECT_LABEL}=")));
        let running_only = args.contains(&"status=running");
        let ids: Vec<&str> = self
            .containers
            .iter()
            .filter(|c| project.is_none() || c.project.as_deref() == project)
            .filter(|c| !running_only || c.running)
            .map(|c| c.id.as_str())
            .collect();
        ok_out(ids.join("\n"))
    }

    fn compose(&mut self, args: &[&str]) -> Out {
        let mut project = None;
        let mut files = Vec::new();
        let mut rest = args;
        let sub = loop {
            match rest {
                ["-p", value, tail @ ..] => {
                    project = Some((*value).to_string());
                    rest = tail;
                }
                ["-f", value, tail @ ..] => {
                    files.push((*value).to_string());
                    rest = tail;
                }
                ["--project-directory" | "--env-file", _, tail @ ..] => rest = tail,
                [sub, ..] => break *sub,
                [] => return fail(1, "compose: no command"),
            }
        };
        if sub == "version" {
            return ok_out("Docker Compose version v2.29.0");
        }
        if !self.docker_running {
            return fail(1, "Cannot connect to the Docker daemon");
        }
        let Some(project) = project else {
            return fail(1, "compose: no project name");
        };
        match sub {
            "build" => {
                for service in self.compose_services.clone() {
                    self.build_image(&format!("{project}-{service}"));
                }
                ok()
            }
            "up" => self.compose_up(&project, &files),
            "down" => {
                self.containers
                    .retain(|c| c.project.as_deref() != Some(project.as_str()));
                ok()
            }
            _ => fail(1, format!("compose: unsupported command {sub}")),
        }
    }

    fn override_images(&self, files: &[String]) -> BTreeMap<String, String> {
        let mut images = BTreeMap::new();
        for file in files.iter().skip(1) {
            let Some(content) = self.files.get(file) else {
                continue;
            };
            let Ok(doc) = serde_yaml::from_str::<serde_yaml::Value>(content) else {
                continue;
            };
            if let Some(services) = doc.get("services").and_then(|s| s.as_mapping()) {
                for (name, service) in services {
                    let image = service.get("image").and_then(|i| i.as_str());
                    if let (Some(name), Some(image)) = (name.as_str(), image) {
                        images.insert(name.to_string(), image.to_string());
                    }
                }
            }
        }
        images
    }

    fn compose_up(&mut self, project: &str, files: &[String]) -> Out {
        let pinned = self.override_images(files);
        let mut started = Vec::new();
        for (index, service) in self.compose_services.clone().iter().enumerate() {
            let reference = pinned
                .get(service)
                .cloned()
                .unwrap_or_else(|| format!("{project}-{service}"));
            let Some(image) = self.resolve_image(&reference) else {
                return fail(1, format!("no image for service {service}: {reference}"));
            };
            started.push((service.clone(), image, index == 0));
        }
        self.containers
            .retain(|c| c.project.as_deref() != Some(project));
        for (service, image, publishes) in started {
            let id = self.new_id("c");
            let port = publishes.then_some(self.compose_port);
            self.containers.push(Container {
                id,
                name: format!("{project}-{service}-1"),
                image,
                running: true,
                port,
                project: Some(project.to_string()),
                service: Some(service),
            });
        }
        ok()
    }
}

fn operands<'a>(args: &[&'a str]) -> Vec<&'a str> {
    args.iter().copied().filter(|a| !a.starts_with('-')).collect()
}

fn value_of<'a>(args: &[&'a str], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| *a == flag)
        .and_then(|i| args.get(i + 1))
        .copied()
}

#[derive(Debug, Clone)]
struct FailRule {
    needle: String,
    exit_code: i32,
    remaining: Option<u32>,
}

/// A [`RemoteExecutor`] backed by [`HostState`].
pub struct FakeHost {
    target: RemoteTarget,
    state: RefCell<HostState>,
    log: RefCell<Vec<String>>,
    failures: RefCell<Vec<FailRule>>,
    triggers: RefCell<Vec<(String, AbortSignal)>>,
    unreachable: Cell<u32>,
    calls: Cell<usize>,
}

impl FakeHost {
    /// A Debian host with nothing installed but the base system.
    pub fn new() -> Self {
        Self::with_target(RemoteTarget::new("10.0.0.5"))
    }

    pub fn with_target(target: RemoteTarget) -> Self {
        Self {
            target,
            state: RefCell::new(HostState::bare()),
            log: RefCell::new(Vec::new()),
            failures: RefCell::new(Vec::new()),
            triggers: RefCell::new(Vec::new()),
            unreachable: Cell::new(0),
            calls: Cell::new(0),
        }
    }

    /// Docker, compose, nginx and curl already installed and running.
    pub fn provisioned() -> Self {
        let host = Self::new();
        {
            let mut state = host.state_mut();
            state.binaries.insert("curl".into());
            state.install_docker();
            state.install_nginx();
        }
        host
    }

    pub fn state(&self) -> Ref<'_, HostState> {
        self.state.borrow()
    }

    pub fn state_mut(&self) -> RefMut<'_, HostState> {
        self.state.borrow_mut()
    }

    /// Every command containing `needle` exits with `exit_code`.
    pub fn fail_on(&self, needle: &str, exit_code: i32) {
        self.failures.borrow_mut().push(FailRule {
            needle: needle.to_string(),
            exit_code,
            remaining: None,
        });
    }

    /// Only the next command containing `needle` fails.
    pub fn fail_once(&self, needle: &str, exit_code: i32) {
        self.failures.borrow_mut().push(FailRule {
            needle: needle.to_string(),
            exit_code,
            remaining: Some(1),
        });
    }

    pub fn clear_failures(&self) {
        self.failures.borrow_mut().clear();
    }

    /// The next `count` connections are refused.
    pub fn unreachable_for(&self, count: u32) {
        self.unreachable.set(count);
    }

    /// Trigger `signal` once a command containing `needle` has run.
    pub fn abort_after(&self, needle: &str, signal: &AbortSignal) {
        self.triggers
            .borrow_mut()
            .push((needle.to_string(), signal.clone()));
    }

    pub fn log(&self) -> Vec<String> {
        self.log.borrow().clone()
    }

    pub fn calls(&self) -> usize {
        self.calls.get()
    }

    pub fn count(&self, needle: &str) -> usize {
        self.log.borrow().iter().filter(|l| l.contains(needle)).count()
    }

    pub fn ran(&self, needle: &str) -> bool {
        self.count(needle) > 0
    }

    pub fn container(&self, name: &str) -> Option<Container> {
        self.state()
            .containers
            .iter()
            .find(|c| c.name == name)
            .cloned()
    }

    pub fn file(&self, path: &str) -> Option<String> {
        self.state().files.get(path).cloned()
    }

    fn connect(&self) -> Result<()> {
        self.calls.set(self.calls.get() + 1);
        let left = self.unreachable.get();
        if left > 0 {
            self.unreachable.set(left - 1);
            return Err(DeployError::Connect {
                host: self.target.host.clone(),
                detail: "Connection refused".into(),
            });
        }
        Ok(())
    }

    fn command(&self, cmd: &Cmd) -> Out {
        let rendered = cmd.render();
        {
            let mut rules = self.failures.borrow_mut();
            let rule = rules
                .iter_mut()
                .find(|r| rendered.contains(&r.needle) && r.remaining != Some(0));
            if let Some(rule) = rule {
                if let Some(left) = rule.remaining.as_mut() {
                    *left -= 1;
                }
                return fail(rule.exit_code, format!("simulated failure: {rendered}"));
            }
        }
        let args: Vec<&str> = cmd.arguments().iter().map(String::as_str).collect();
        let out = self.state.borrow_mut().exec(cmd.program(), &args);
        for (needle, signal) in self.triggers.borrow().iter() {
            if rendered.contains(needle.as_str()) {
                signal.trigger();
            }
        }
        out
    }
}

impl RemoteExecutor for FakeHost {
    fn target(&self) -> &RemoteTarget {
        &self.target
    }

    fn execute(&self, script: &Script, _opts: &ExecOptions) -> Result<ExecOutput> {
        self.connect()?;
        self.log.borrow_mut().push(script.render());
        self.state_mut().privileged = self.target.is_root() || script.is_sudo();

        let mut output = ExecOutput::default();
        for (connector, cmd) in script.commands() {
            let runs = match connector {
                None | Some(Connector::Then | Connector::Pipe) => true,
                Some(Connector::And) => output.exit_code == 0,
                Some(Connector::Or) => output.exit_code != 0,
            };
            if !runs {
                continue;
            }
            let (code, stdout, stderr) = self.command(cmd);
            output.exit_code = code;
            if !cmd.is_quiet() {
                output.stdout.push_str(&stdout);
                output.stderr.push_str(&stderr);
            }
        }
        Ok(output)
    }

    fn write_file(&self, content: &[u8], remote_path: &str) -> Result<()> {
        self.connect()?;
        self.log.borrow_mut().push(format!("write {remote_path}"));
        self.state_mut().files.insert(
            remote_path.to_string(),
            String::from_utf8_lossy(content).into_owned(),
        );
        Ok(())
    }

    fn copy_file(&self, local: &Path, remote_path: &str) -> Result<()> {
        self.connect()?;
        self.log
            .borrow_mut()
            .push(format!("copy {} {remote_path}", local.display()));
        self.state_mut()
            .files
            .insert(remote_path.to_string(), "<archive>".into());
        Ok(())
    }
}

/// Returns a fixed local directory instead of cloning.
pub struct StaticSource {
    dir: PathBuf,
}

impl StaticSource {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }
}

impl SourceStage for StaticSource {
    fn stage(&self, _url: &str, _credential: &Credential, _branch: &str) -> Result<PathBuf> {
        Ok(self.dir.clone())
    }
}

/// Creates the destination directory; file contents are not modelled.
pub struct DirTransfer;

impl FileTransfer for DirTransfer {
    fn transfer(
        &self,
        remote: &dyn RemoteExecutor,
        local_dir: &Path,
        remote_dir: &str,
    ) -> Result<()> {
        if !local_dir.is_dir() {
            return Err(DeployError::FileNotFound(local_dir.display().to_string()));
        }
        remote.run(
            Script::new(Cmd::new("mkdir").args(["-p", remote_dir])),
            &ExecOptions::default(),
        )?;
        Ok(())
    }
}

/// A local checkout holding `files`.
pub fn source_tree(files: &[(&str, &str)]) -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    for (name, content) in files {
        let path = dir.path().join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, content).unwrap();
    }
    dir
}

pub fn dockerfile_tree() -> TempDir {
    source_tree(&[("Dockerfile", "FROM nginx:alpine\nEXPOSE 8080\n")])
}

pub const COMPOSE_YAML: &str = "\
services:
  web:
    build: .
    ports:
      - \"8080:8080\"
  worker:
    build: .
";

pub fn compose_tree() -> TempDir {
    source_tree(&[
        ("compose.yaml", COMPOSE_YAML),
        ("Dockerfile", "FROM alpine\n"),
    ])
}

/// Base config for `shop` on port 8080 with a fast health policy.
pub fn base_config() -> DeploymentConfig {
    DeploymentConfig::new("10.0.0.5")
        .repository("https://example.com/acme/shop.git")
        .app_port(8080)
        .app_dir("/opt/shop")
        .health(
            HealthPolicy::default()
                .attempts(2)
                .interval(Duration::ZERO),
        )
}

pub fn config() -> ValidConfig {
    base_config().validate().unwrap()
}

/// A pipeline that stages `source` and never sleeps.
pub fn pipeline(config: ValidConfig, source: &Path) -> Pipeline {
    Pipeline::new(config)
        .stage(StaticSource::new(source))
        .transfer(DirTransfer)
        .provisioner(Provisioner::new().settle(1, Duration::ZERO))
}
