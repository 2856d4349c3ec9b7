#![allow(dead_code)]

use std::collections::{BTreeSet, HashMap};
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use modcrane::engine::{CommandOutput, CommandRunner, Engine, RetryPolicy};
use modcrane::error::AppError;
use modcrane::http::{Fetch, HttpClient};
use modcrane::system::{ContainerSystem, SystemOptions};
use serde_json::{Value, json};

/// Canned registry and catalog responses keyed by URL. Unknown URLs are 404s.
#[derive(Default)]
pub struct FakeHttp {
    responses: HashMap<String, Value>,
}

impl FakeHttp {
    pub fn new() -> Self {
        Self::default()
    }

    /// Docker Hub tag listing for `org/name`.
    pub fn with_tags(mut self, org: &str, name: &str, tags: &[&str]) -> Self {
        let results: Vec<Value> = tags.iter().map(|tag| json!({ "name": tag })).collect();
        self.responses.insert(
            format!("https://hub.docker.com/v2/repositories/{org}/{name}/tags/"),
            json!({ "results": results, "next": null }),
        );
        self
    }

    /// Tool catalog record for `name`.
    pub fn with_tool(mut self, name: &str, record: Value) -> Self {
        self.responses.insert(format!("https://bio.tools/api/tool/{name}?format=json"), record);
        self
    }
}

impl HttpClient for FakeHttp {
    fn get_json(&self, url: &str) -> Fetch<Value> {
        match self.responses.get(url) {
            Some(value) => Fetch::Found(value.clone()),
            None => Fetch::NotFound,
        }
    }
}

/// Scripted docker host. Images are matched by substring of the command.
#[derive(Default)]
pub struct FakeRunner {
    listings: HashMap<String, String>,
    failing_pulls: BTreeSet<String>,
    shellless: BTreeSet<String>,
    calls: Mutex<Vec<String>>,
}

impl FakeRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Programs printed by the listing command inside `image`.
    pub fn with_programs(mut self, image: &str, programs: &[&str]) -> Self {
        let mut listing = programs.join("\n");
        listing.push('\n');
        self.listings.insert(image.to_string(), listing);
        self
    }

    pub fn failing_pull(mut self, image: &str) -> Self {
        self.failing_pulls.insert(image.to_string());
        self
    }

    pub fn without_shell(mut self, image: &str) -> Self {
        self.shellless.insert(image.to_string());
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count_calls(&self, needle: &str) -> usize {
        self.calls().iter().filter(|call| call.contains(needle)).count()
    }

    fn mentions(images: &BTreeSet<String>, script: &str) -> bool {
        images.iter().any(|image| script.contains(image.as_str()))
    }
}

impl CommandRunner for FakeRunner {
    fn run(&self, script: &str, _env: &[(String, String)]) -> io::Result<CommandOutput> {
        self.calls.lock().unwrap().push(script.to_string());
        let ok = |stdout: String| CommandOutput { success: true, stdout, stderr: String::new() };
        let failed = || CommandOutput {
            success: false,
            stdout: String::new(),
            stderr: "failed".to_string(),
        };

        if script.starts_with("docker pull") {
            let fails = Self::mentions(&self.failing_pulls, script);
            return Ok(if fails { failed() } else { ok(String::new()) });
        }
        if script.contains("[ -e /bin/") {
            let bash = script.contains("[ -e /bin/bash ]");
            let usable = bash && !Self::mentions(&self.shellless, script);
            return Ok(if usable { ok(String::new()) } else { failed() });
        }
        if script.contains(" -c '") {
            let listing = self
                .listings
                .iter()
                .find(|(image, _)| script.contains(image.as_str()))
                .map(|(_, listing)| listing.clone())
                .unwrap_or_default();
            return Ok(ok(listing));
        }
        Ok(ok(String::new()))
    }
}

pub fn options(root: &Path, threads: usize) -> SystemOptions {
    let mut options =
        SystemOptions::new(root.join("containers"), root.join("modulefiles"), root.join("cache"));
    options.threads = threads;
    options.retry = RetryPolicy { attempts: 1, delay: Duration::from_millis(0) };
    options
}

pub fn docker_system(
    options: SystemOptions,
    http: FakeHttp,
    runner: Arc<FakeRunner>,
) -> Result<ContainerSystem, AppError> {
    ContainerSystem::new(options, Engine::Docker, Arc::new(http), runner)
}

pub fn urls(items: &[&str]) -> Vec<String> {
    items.iter().map(|item| item.to_string()).collect()
}
