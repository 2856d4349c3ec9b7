//! Lmod modulefile generation.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use regex::Regex;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::error::AppError;
use crate::model::{ImageHandle, ImageReference, Metadata};

const LMOD_TEMPLATE: &str = include_str!("templates/lmod.tmpl");

/// Placeholders a usage tracker URL must carry, sorted.
pub const TRACKER_TARGETS: [&str; 3] = ["application", "package_name", "package_version"];

const FIELD_PATTERN: &str = r"&(entry\.\d+)=([^&]+)";
const FORM_PATTERN: &str = r"^(https://docs\.google\.com/forms/././\w+/)viewform";

const POSIX_QUIET: &str = ">/dev/null 2>&1";
const CSH_QUIET: &str = ">& /dev/null";

/// Decodes `%XX` escapes. Malformed escapes are kept verbatim.
pub fn unescape_url(url: &str) -> String {
    let bytes = url.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut index = 0;
    while index < bytes.len() {
        if bytes[index] == b'%'
            && index + 2 < bytes.len()
            && let (Some(high), Some(low)) =
                (hex_value(bytes[index + 1]), hex_value(bytes[index + 2]))
        {
            decoded.push(high << 4 | low);
            index += 3;
            continue;
        }
        decoded.push(bytes[index]);
        index += 1;
    }
    String::from_utf8_lossy(&decoded).into_owned()
}

fn hex_value(byte: u8) -> Option<u8> {
    (byte as char).to_digit(16).map(|digit| digit as u8)
}

/// Fills `{key}` placeholders in a single pass.
///
/// `{{` and `}}` collapse to literal braces; unknown keys are left untouched.
pub fn fill_template(template: &str, values: &[(&str, &str)]) -> String {
    let mut filled = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(position) = rest.find(['{', '}']) {
        filled.push_str(&rest[..position]);
        let tail = &rest[position..];
        if tail.starts_with("{{") || tail.starts_with("}}") {
            filled.push_str(&tail[..1]);
            rest = &tail[2..];
            continue;
        }
        if tail.starts_with('{')
            && let Some(end) = tail.find('}')
            && let Some((_, value)) = values.iter().find(|(key, _)| *key == &tail[1..end])
        {
            filled.push_str(value);
            rest = &tail[end + 1..];
            continue;
        }
        filled.push_str(&tail[..1]);
        rest = &tail[1..];
    }
    filled.push_str(rest);
    filled
}

/// Escapes `value` for use inside a double-quoted Lua string.
pub fn lua_escape(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace(['\n', '\r'], " ")
}

fn tracker_target(value: &str) -> Option<&'static str> {
    let bare = value.strip_prefix('{').and_then(|inner| inner.strip_suffix('}')).unwrap_or(value);
    TRACKER_TARGETS.iter().copied().find(|target| *target == bare)
}

/// `curl` invocation that reports program usage to a Google Form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerCommand {
    base: String,
    fields: Vec<(String, String)>,
}

impl TrackerCommand {
    /// Parses a pre-filled form URL, failing when a placeholder is missing.
    pub fn parse(url: &str) -> Result<Self, AppError> {
        let unescaped = unescape_url(url);
        let field_re = Regex::new(FIELD_PATTERN).map_err(|err| AppError::config(err.to_string()))?;
        let form_re = Regex::new(FORM_PATTERN).map_err(|err| AppError::config(err.to_string()))?;

        let mut found = BTreeSet::new();
        let mut fields = Vec::new();
        for captures in field_re.captures_iter(&unescaped) {
            let value = &captures[2];
            let value = match tracker_target(value) {
                Some(target) => {
                    found.insert(target);
                    format!("{{{target}}}")
                }
                None => escape_shell_variables(value),
            };
            fields.push((captures[1].to_string(), value));
        }
        let missing: Vec<String> = TRACKER_TARGETS
            .iter()
            .filter(|target| !found.contains(*target))
            .map(|target| target.to_string())
            .collect();
        if !missing.is_empty() {
            let listed = missing.join(", ");
            error!(url = %unescaped, missing = %listed, "tracker url is missing fields");
            return Err(AppError::TrackerFields { missing, url: unescaped });
        }
        let base = form_re
            .captures(&unescaped)
            .map(|captures| captures[1].to_string())
            .ok_or_else(|| AppError::TrackerUrl(unescaped.clone()))?;
        Ok(Self { base, fields })
    }

    /// Command with `{package_name}`, `{package_version}` and `{application}`
    /// still unfilled and shell variables written as `${{VAR}}`.
    pub fn template(&self, quiet: &str) -> String {
        let data: String =
            self.fields.iter().map(|(entry, value)| format!(" -d {entry}={value}")).collect();
        format!("curl -sL {}formResponse -d submit=Submit{data} {quiet}", self.base)
    }

    pub fn command(&self, name: &str, version: &str, application: &str, quiet: &str) -> String {
        fill_template(
            &self.template(quiet),
            &[("package_name", name), ("package_version", version), ("application", application)],
        )
    }
}

/// Doubles the braces of `${VAR}` so the variable survives template filling.
fn escape_shell_variables(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    let mut rest = value;
    while let Some(start) = rest.find("${") {
        escaped.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end)
                if end > 0 && after[..end].chars().all(|c| c.is_alphanumeric() || c == '_') =>
            {
                escaped.push_str("${{");
                escaped.push_str(&after[..end]);
                escaped.push_str("}}");
                rest = &after[end + 1..];
            }
            _ => {
                escaped.push_str("${");
                rest = after;
            }
        }
    }
    escaped.push_str(rest);
    escaped
}

pub fn validate_tracker_url(url: &str) -> Result<(), AppError> {
    TrackerCommand::parse(url).map(|_| ())
}

/// The bash-compatible command for `url`, placeholders still unfilled.
pub fn curl_tracker_url(url: &str) -> Result<String, AppError> {
    Ok(TrackerCommand::parse(url)?.template("&>/dev/null"))
}

#[derive(Debug, Clone, Default)]
pub struct ModuleOptions {
    pub module_dir: PathBuf,
    /// Replaces the working directory in image paths, e.g. `$WORK/containers`.
    pub path_prefix: Option<String>,
    pub module_prefix: Option<String>,
    pub contact: Vec<String>,
    pub tracker_url: Option<String>,
    pub prereqs: Vec<String>,
    pub force: bool,
}

/// Everything one modulefile is rendered from.
pub struct ModulePage<'a> {
    pub reference: &'a ImageReference,
    pub metadata: &'a Metadata,
    pub image: &'a ImageHandle,
    pub programs: &'a [String],
}

pub struct ModuleRenderer {
    options: ModuleOptions,
    tracker: Option<TrackerCommand>,
    working_dir: PathBuf,
}

impl ModuleRenderer {
    /// Fails before anything is written when the tracker URL is unusable.
    pub fn new(options: ModuleOptions) -> Result<Self, AppError> {
        let tracker = match options.tracker_url.as_deref() {
            Some(url) if !url.is_empty() => Some(TrackerCommand::parse(url)?),
            _ => None,
        };
        let working_dir = std::env::current_dir()?;
        Ok(Self { options, tracker, working_dir })
    }

    pub fn module_dir(&self) -> &Path {
        &self.options.module_dir
    }

    pub fn module_path(&self, reference: &ImageReference) -> PathBuf {
        let version = reference.module_tag(self.options.module_prefix.as_deref());
        self.options.module_dir.join(&reference.name).join(format!("{version}.lua"))
    }

    /// Writes the modulefile for `page`, keeping an existing one unless forced.
    pub fn render(&self, page: &ModulePage<'_>) -> Result<PathBuf, AppError> {
        let path = self.module_path(page.reference);
        if path.exists() && !self.options.force {
            debug!(path = %path.display(), "modulefile already exists, skipping");
            return Ok(path);
        }
        if page.programs.is_empty() {
            warn!(url = %page.reference, "no programs left to expose after blocking");
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, self.render_text(page))?;
        debug!(path = %path.display(), "wrote modulefile");
        Ok(path)
    }

    pub fn render_text(&self, page: &ModulePage<'_>) -> String {
        let reference = page.reference;
        let metadata = page.metadata;
        let version = reference.module_tag(self.options.module_prefix.as_deref());
        let home_url = metadata.homepage.clone().unwrap_or_else(|| reference.full_url.clone());
        let programs_string = page
            .programs
            .iter()
            .map(|program| format!(" - {program}"))
            .collect::<Vec<_>>()
            .join("\n");
        let contact = self
            .options
            .contact
            .iter()
            .map(|url| format!("\t{url}"))
            .collect::<Vec<_>>()
            .join("\n");
        let summary = metadata.description.replace("]==]", "] ==]");
        let shell_functions = self.shell_functions(page, &version);

        let name = lua_escape(&reference.name);
        let url = lua_escape(&reference.sanitized);
        let web_url = lua_escape(&reference.full_url);
        let home_url = lua_escape(&home_url);
        let description = lua_escape(&metadata.description);
        let keywords = lua_escape(&metadata.keywords.join(", "));
        let categories = lua_escape(&metadata.categories.join(", "));
        let version_escaped = lua_escape(&version);

        let mut text = fill_template(
            LMOD_TEMPLATE,
            &[
                ("name", name.as_str()),
                ("version", version_escaped.as_str()),
                ("url", url.as_str()),
                ("web_url", web_url.as_str()),
                ("home_url", home_url.as_str()),
                ("summary", summary.as_str()),
                ("description", description.as_str()),
                ("keywords", keywords.as_str()),
                ("categories", categories.as_str()),
                ("contact", contact.as_str()),
                ("programs_string", programs_string.as_str()),
                ("shell_functions", shell_functions.as_str()),
            ],
        );

        let prereqs: Vec<String> = self
            .options
            .prereqs
            .iter()
            .filter(|prereq| !prereq.is_empty())
            .map(|prereq| lua_escape(prereq))
            .collect();
        if !prereqs.is_empty() {
            let joined = prereqs.join("\",\"");
            text.push_str(&format!("\ndepends_on(\"{joined}\")\nprereq(\"{joined}\")\n"));
        }
        text
    }

    /// The engine command each wrapper runs, with the program in `$RGC_APP`.
    ///
    /// Docker images replace their entrypoint with the program, so images
    /// that declare one still run the requested tool.
    pub fn run_command(&self, image: &ImageHandle) -> String {
        match image {
            ImageHandle::Daemon(reference) => {
                format!("docker run --rm -i --entrypoint $RGC_APP {reference}")
            }
            ImageHandle::File(path) => {
                format!("singularity exec {} $RGC_APP", self.image_location(path))
            }
        }
    }

    fn image_location(&self, path: &Path) -> String {
        let relative = path.strip_prefix(".").unwrap_or(path);
        match self.options.path_prefix.as_deref() {
            Some(prefix) if !prefix.is_empty() => {
                let trimmed = relative.display().to_string();
                format!("{}/{}", prefix.trim_end_matches('/'), trimmed.trim_start_matches('/'))
            }
            _ if relative.is_absolute() => relative.display().to_string(),
            _ => self.working_dir.join(relative).display().to_string(),
        }
    }

    fn shell_functions(&self, page: &ModulePage<'_>, version: &str) -> String {
        let run = self.run_command(page.image);
        let name = &page.reference.name;
        let (posix_run, csh_run) = match &self.tracker {
            Some(tracker) => (
                format!("{}; {run}", tracker.command(name, version, "$RGC_APP", POSIX_QUIET)),
                format!("{}; {run}", tracker.command(name, version, "$RGC_APP", CSH_QUIET)),
            ),
            None => (run.clone(), run),
        };
        page.programs
            .iter()
            .map(|program| {
                let posix = format!("RGC_APP={program}; {posix_run} \"$@\"");
                let csh = format!("set RGC_APP={program}; {csh_run} $*");
                format!(
                    "set_shell_function(\"{program}\", \"{}\", \"{}\")",
                    lua_escape(&posix),
                    lua_escape(&csh)
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Deletes `.lua` files under the module directory not listed in `keep`.
    pub fn prune(&self, keep: &BTreeSet<PathBuf>) -> Result<Vec<PathBuf>, AppError> {
        let mut removed = Vec::new();
        if !self.options.module_dir.is_dir() {
            return Ok(removed);
        }
        info!("deleting unused module files");
        for entry in WalkDir::new(&self.options.module_dir).into_iter().filter_map(Result::ok) {
            let path = entry.path();
            let is_module = path.extension().is_some_and(|extension| extension == "lua");
            if entry.file_type().is_file() && is_module && !keep.contains(path) {
                info!(path = %path.display(), "deleting old modulefile");
                fs::remove_file(path)?;
                removed.push(path.to_path_buf());
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reference::parse;

    const FORM_ID: &str = "1FAIpQLSdLcvekCL9ads0MvfoY2hLKWgCU_ck1RbDrmKYymaJpY5WWsA";

    const TRACKER: &str = concat!(
        "https://docs.google.com/forms/d/e/",
        "1FAIpQLSdLcvekCL9ads0MvfoY2hLKWgCU_ck1RbDrmKYymaJpY5WWsA",
        "/viewform?usp=pp_url",
        "&entry.288148883=$%7B%7BSLURM_JOB_ID%7D%7D",
        "&entry.104394543=$%7B%7BTACC_SYSTEM%7D%7D",
        "&entry.264814955=%7Bpackage_name%7D",
        "&entry.750252445=%7Bpackage_version%7D",
        "&entry.2023109786=%7Bapplication%7D",
    );

    #[test]
    fn unescapes_percent_encoding() {
        assert_eq!(
            unescape_url("$%7B%7BSLURM_JOB_ID%7D%7D&x=%7Bapp%7D"),
            "${{SLURM_JOB_ID}}&x={app}"
        );
        assert_eq!(unescape_url("100%"), "100%");
        assert_eq!(unescape_url("%zz%4"), "%zz%4");
    }

    #[test]
    fn synthesizes_curl_command() {
        let expected = format!(
            "curl -sL https://docs.google.com/forms/d/e/{FORM_ID}/formResponse -d submit=Submit \
             -d entry.288148883=${{{{SLURM_JOB_ID}}}} -d entry.104394543=${{{{TACC_SYSTEM}}}} \
             -d entry.264814955={{package_name}} -d entry.750252445={{package_version}} \
             -d entry.2023109786={{application}} &>/dev/null"
        );
        assert_eq!(curl_tracker_url(TRACKER).unwrap(), expected);
    }

    #[test]
    fn single_brace_variables_are_escaped() {
        let url = TRACKER.replace("$%7B%7BSLURM_JOB_ID%7D%7D", "$%7BSLURM_JOB_ID%7D");
        assert!(curl_tracker_url(&url).unwrap().contains("entry.288148883=${{SLURM_JOB_ID}}"));
    }

    #[test]
    fn missing_application_field_is_named() {
        let url = TRACKER.replace("&entry.2023109786=%7Bapplication%7D", "");
        match validate_tracker_url(&url) {
            Err(AppError::TrackerFields { missing, .. }) => {
                assert_eq!(missing, vec!["application"])
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn non_form_url_is_rejected() {
        let url = TRACKER.replace("docs.google.com/forms", "example.com/forms");
        assert!(matches!(validate_tracker_url(&url), Err(AppError::TrackerUrl(_))));
    }

    #[test]
    fn fills_known_keys_once() {
        let filled = fill_template("{a} {{b}} {c} ${{X}} }", &[("a", "{c}"), ("c", "3")]);
        assert_eq!(filled, "{c} {b} 3 ${X} }");
    }

    #[test]
    fn escapes_lua_strings() {
        assert_eq!(lua_escape(r#"say "hi"\now"#), r#"say \"hi\"\\now"#);
        assert_eq!(lua_escape("two\nlines"), "two lines");
    }

    fn options(dir: &Path) -> ModuleOptions {
        ModuleOptions {
            module_dir: dir.to_path_buf(),
            path_prefix: Some("$WORK/containers".to_string()),
            module_prefix: Some("ctr".to_string()),
            contact: vec!["https://a.test/issues".to_string(), "https://b.test".to_string()],
            tracker_url: None,
            prereqs: vec!["tacc-singularity".to_string()],
            force: false,
        }
    }

    #[test]
    fn renders_lmod_module() {
        let dir = tempfile::tempdir().unwrap();
        let renderer = ModuleRenderer::new(options(dir.path())).unwrap();
        let reference = parse("quay.io/biocontainers/bwa:0.7.17");
        let metadata = Metadata::placeholder("bwa");
        let image = ImageHandle::File("./containers/bwa/bwa-0.7.17.sif".into());
        let programs = vec!["bwa".to_string(), "bwa-mem".to_string()];
        let page = ModulePage {
            reference: &reference,
            metadata: &metadata,
            image: &image,
            programs: &programs,
        };

        let path = renderer.render(&page).unwrap();
        assert_eq!(path, dir.path().join("bwa/ctr-0.7.17.lua"));
        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains("whatis(\"Version: ctr-0.7.17\")"));
        assert!(text.contains("whatis(\"URL: https://quay.io/repository/biocontainers/bwa\")"));
        assert!(text.contains(" - bwa\n - bwa-mem"));
        assert!(text.contains("\thttps://a.test/issues\n\thttps://b.test"));
        let image_path = "$WORK/containers/containers/bwa/bwa-0.7.17.sif";
        let posix = format!(r#"RGC_APP=bwa; singularity exec {image_path} $RGC_APP \"$@\""#);
        assert!(text.contains(&format!(r#"set_shell_function("bwa", "{posix}", "#)));
        assert!(text.contains(&format!(
            r#""set RGC_APP=bwa; singularity exec {image_path} $RGC_APP $*")"#
        )));
        assert!(text.ends_with("depends_on(\"tacc-singularity\")\nprereq(\"tacc-singularity\")\n"));
    }

    #[test]
    fn existing_module_is_kept_unless_forced() {
        let dir = tempfile::tempdir().unwrap();
        let reference = parse("biocontainers/bwa:v1");
        let metadata = Metadata::placeholder("bwa");
        let image = ImageHandle::Daemon("biocontainers/bwa:v1".into());
        let programs = vec!["bwa".to_string()];
        let page = ModulePage {
            reference: &reference,
            metadata: &metadata,
            image: &image,
            programs: &programs,
        };

        let path = dir.path().join("bwa/ctr-v1.lua");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "keep").unwrap();
        ModuleRenderer::new(options(dir.path())).unwrap().render(&page).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "keep");

        let forced = ModuleOptions { force: true, ..options(dir.path()) };
        ModuleRenderer::new(forced).unwrap().render(&page).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains(
            r#"RGC_APP=bwa; docker run --rm -i --entrypoint $RGC_APP biocontainers/bwa:v1 \"$@\""#
        ));
        assert!(!text.contains("biocontainers/bwa:v1 $RGC_APP"));
    }

    #[test]
    fn tracker_runs_before_program() {
        let dir = tempfile::tempdir().unwrap();
        let tracked =
            ModuleOptions { tracker_url: Some(TRACKER.to_string()), ..options(dir.path()) };
        let renderer = ModuleRenderer::new(tracked).unwrap();
        let reference = parse("biocontainers/bwa:v1");
        let metadata = Metadata::placeholder("bwa");
        let image = ImageHandle::Daemon("biocontainers/bwa:v1".into());
        let programs = vec!["bwa".to_string()];
        let page = ModulePage {
            reference: &reference,
            metadata: &metadata,
            image: &image,
            programs: &programs,
        };
        let text = renderer.render_text(&page);
        assert!(text.contains("-d entry.288148883=${SLURM_JOB_ID}"));
        let run = "docker run --rm -i --entrypoint $RGC_APP biocontainers/bwa:v1";
        assert!(text.contains(&format!(
            "-d entry.264814955=bwa -d entry.750252445=ctr-v1 -d entry.2023109786=$RGC_APP \
             >/dev/null 2>&1; {run} \\\"$@\\\""
        )));
        assert!(text.contains(&format!("$RGC_APP >& /dev/null; {run} $*")));
    }

    #[test]
    fn bad_tracker_fails_before_rendering() {
        let dir = tempfile::tempdir().unwrap();
        let url = TRACKER.replace("&entry.264814955=%7Bpackage_name%7D", "");
        let broken = ModuleOptions { tracker_url: Some(url), ..options(dir.path()) };
        assert!(matches!(ModuleRenderer::new(broken), Err(AppError::TrackerFields { .. })));
    }

    #[test]
    fn prune_removes_stale_lua_files() {
        let dir = tempfile::tempdir().unwrap();
        for file in ["bwa/1.lua", "bwa/0.lua", "bwa/notes.txt"] {
            let path = dir.path().join(file);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, "").unwrap();
        }
        let renderer = ModuleRenderer::new(options(dir.path())).unwrap();
        let keep: BTreeSet<PathBuf> = [dir.path().join("bwa/1.lua")].into_iter().collect();
        assert_eq!(renderer.prune(&keep).unwrap(), vec![dir.path().join("bwa/0.lua")]);
        assert!(dir.path().join("bwa/notes.txt").exists());
    }
}
