use clap::{Parser, Subcommand};
use dialoguer::console::style;
use dialoguer::theme::ColorfulTheme;
use dialoguer::Confirm;
use dirs::home_dir;
use env_logger::Env;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use std::env;
use std::fs;
use std::io;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

const NAMESPACE: &str = "podkernel";
const DEFAULT_CONTAINER_COMMAND: &str = "podman";
const KERNEL_SPEC_FILENAME: &str = "kernel.json";
const ARGUMENT_DELIMITER: &str = "--";
const CONTAINER_CONNECTION_PATH: &str = "/kernel/conn.json";
// Injected in the listed order; the podkernel variable comes last so it wins
// under the runtime's last-occurrence semantics.
const CONNECTION_FILE_ENV_VARS: [&str; 2] =
    ["DOCKERNEL_CONNECTION_FILE", "PODKERNEL_CONNECTION_FILE"];
const CONNECTION_FILE_TEMPLATE: &str = "{connection_file}";
const STOP_GRACE_SECONDS: u32 = 10;
const DISALLOWED_RUN_ARGS: [&str; 9] = [
    "--rm",
    "-d",
    "--detach",
    "-i",
    "--interactive",
    "-t",
    "--tty",
    "-a",
    "--attach",
];

#[derive(Parser, Debug)]
#[command(name = "podkernel", version, about = "Manage Jupyter kernels in podman containers")]
struct Cli {
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
    #[arg(long, global = true)]
    json: bool,
    #[arg(long, global = true, hide = true)]
    container_command: Option<String>,
    #[arg(long, global = true, hide = true)]
    kernel_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    Install {
        #[arg(long)]
        build: bool,
        #[arg(long)]
        display_name: Option<String>,
        #[arg(long, default_value = "python")]
        language: String,
        image_name: Option<String>,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        arguments: Vec<String>,
    },
    Start {
        kernel_id: String,
        connection_file: PathBuf,
    },
    Build {
        kernel_id: String,
    },
    List,
    Delete {
        #[arg(long)]
        yes: bool,
        #[arg(long)]
        dry_run: bool,
        kernel_id: String,
    },
    Doctor,
}

#[derive(Debug, Error)]
enum PodkernelError {
    #[error("argument error: {0}")]
    Argument(String),
    #[error("connection file error: {0}")]
    ConnectionFile(String),
    #[error("build error: {message}")]
    Build { message: String, status_code: i32 },
    #[error("launch error: {0}")]
    Launch(String),
    #[error("kernel spec error: {0}")]
    KernelSpec(String),
    #[error("config error: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("prompt error: {0}")]
    Prompt(#[from] dialoguer::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum InterruptMode {
    Signal,
    Message,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct KernelSpec {
    argv: Vec<String>,
    display_name: String,
    language: String,
    interrupt_mode: InterruptMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    env: Option<BTreeMap<String, String>>,
    metadata: KernelSpecMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct KernelSpecMetadata {
    podkernel: LaunchTemplate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct LaunchTemplate {
    image_name: String,
    build: bool,
    #[serde(default)]
    build_args: Vec<String>,
    #[serde(default)]
    run_args: Vec<String>,
    #[serde(default)]
    cmd_args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Segments {
    build_args: Vec<String>,
    run_args: Vec<String>,
    cmd_args: Vec<String>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
struct ConnectionPorts {
    shell_port: u16,
    iopub_port: u16,
    stdin_port: u16,
    control_port: u16,
    hb_port: u16,
}

impl ConnectionPorts {
    fn as_set(&self) -> BTreeSet<u16> {
        BTreeSet::from([
            self.shell_port,
            self.iopub_port,
            self.stdin_port,
            self.control_port,
            self.hb_port,
        ])
    }
}

#[derive(Debug, Clone)]
struct InjectionSet {
    connection_file: PathBuf,
    ports: BTreeSet<u16>,
    cidfile: PathBuf,
    image_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct JsonResult<T: Serialize> {
    ok: bool,
    result: Option<T>,
    error: Option<String>,
}

#[derive(Debug, Clone)]
struct Context {
    container_command: String,
    kernel_dir: PathBuf,
    json: bool,
}

#[derive(Debug, Clone)]
struct CommandOutput {
    status_code: i32,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

impl CommandOutput {
    fn success(&self) -> bool {
        self.status_code == 0
    }
}

trait RuntimeRunner {
    fn run(
        &self,
        exe: &Path,
        args: &[String],
        capture_output: bool,
    ) -> Result<CommandOutput, io::Error>;
}

struct HostRuntimeRunner;

impl RuntimeRunner for HostRuntimeRunner {
    fn run(
        &self,
        exe: &Path,
        args: &[String],
        capture_output: bool,
    ) -> Result<CommandOutput, io::Error> {
        let mut cmd = Command::new(exe);
        cmd.args(args);
        if capture_output {
            let output = cmd.output()?;
            let status_code =
                output
                    .status
                    .code()
                    .unwrap_or(if output.status.success() { 0 } else { 1 });
            Ok(CommandOutput {
                status_code,
                stdout: output.stdout,
                stderr: output.stderr,
            })
        } else {
            let status = cmd.status()?;
            let status_code = status
                .code()
                .unwrap_or(if status.success() { 0 } else { 1 });
            Ok(CommandOutput {
                status_code,
                stdout: Vec::new(),
                stderr: Vec::new(),
            })
        }
    }
}

fn main() -> Result<(), PodkernelError> {
    let cli = Cli::parse();
    init_logging(&cli.log_level);
    let ctx = build_context(&cli)?;
    let runner = HostRuntimeRunner;

    let result = match cli.command {
        Commands::Install {
            build,
            display_name,
            language,
            image_name,
            arguments,
        } => handle_install(&ctx, build, display_name, language, image_name, &arguments),
        Commands::Start {
            kernel_id,
            connection_file,
        } => handle_start(&ctx, &runner, &kernel_id, &connection_file),
        Commands::Build { kernel_id } => handle_build(&ctx, &runner, &kernel_id),
        Commands::List => handle_list(&ctx),
        Commands::Delete {
            yes,
            dry_run,
            kernel_id,
        } => handle_delete(&ctx, &kernel_id, yes, dry_run),
        Commands::Doctor => handle_doctor(&ctx, &runner),
    };

    match result {
        Ok(0) => Ok(()),
        Ok(code) => std::process::exit(code),
        Err(err) => {
            if ctx.json {
                let payload = JsonResult::<serde_json::Value> {
                    ok: false,
                    result: None,
                    error: Some(err.to_string()),
                };
                print_json(&payload)?;
            } else {
                eprintln!("{err}");
            }
            std::process::exit(exit_code_for(&err));
        }
    }
}

fn exit_code_for(err: &PodkernelError) -> i32 {
    match err {
        PodkernelError::Build { status_code, .. } if *status_code != 0 => *status_code,
        _ => 1,
    }
}

fn init_logging(log_level: &str) {
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level)).init();
}

fn build_context(cli: &Cli) -> Result<Context, PodkernelError> {
    let container_command = resolve_container_command(cli.container_command.as_deref());
    let kernel_dir = resolve_kernel_dir(cli.kernel_dir.as_ref())?;
    Ok(Context {
        container_command,
        kernel_dir,
        json: cli.json,
    })
}

fn resolve_container_command(override_command: Option<&str>) -> String {
    if let Some(command) = override_command {
        return command.to_string();
    }
    if let Ok(command) = env::var("PODKERNEL_CONTAINER_COMMAND") {
        if !command.trim().is_empty() {
            return command;
        }
    }
    DEFAULT_CONTAINER_COMMAND.to_string()
}

fn resolve_kernel_dir(override_path: Option<&PathBuf>) -> Result<PathBuf, PodkernelError> {
    if let Some(path) = override_path {
        return Ok(path.clone());
    }
    if let Ok(path) = env::var("PODKERNEL_KERNEL_DIR") {
        return Ok(PathBuf::from(path));
    }
    if let Ok(path) = env::var("JUPYTER_DATA_DIR") {
        return Ok(PathBuf::from(path).join("kernels"));
    }
    let home = required_home_dir()?;
    default_kernel_store(env::consts::OS, &home)
}

fn default_kernel_store(os: &str, home: &Path) -> Result<PathBuf, PodkernelError> {
    match os {
        "linux" => Ok(home.join(".local/share/jupyter/kernels")),
        "macos" => Ok(home.join("Library/Jupyter/kernels")),
        "windows" => {
            let appdata = env::var("APPDATA").map_err(|_| {
                PodkernelError::Config(
                    "APPDATA is not set; unable to locate the jupyter kernel store".to_string(),
                )
            })?;
            Ok(PathBuf::from(appdata).join("jupyter").join("kernels"))
        }
        other => Err(PodkernelError::Config(format!(
            "unsupported operating system for kernel store discovery: {other}"
        ))),
    }
}

fn required_home_dir() -> Result<PathBuf, PodkernelError> {
    home_dir().ok_or_else(|| {
        PodkernelError::Config(
            "unable to resolve $HOME; set HOME to an existing directory".to_string(),
        )
    })
}

fn expand_home_path(input: &str) -> PathBuf {
    if input == "~" {
        if let Some(home) = home_dir() {
            return home;
        }
    }
    if let Some(stripped) = input.strip_prefix("~/") {
        if let Some(home) = home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(input)
}

fn relativize_home_path(path: &Path) -> String {
    if let Some(home) = home_dir() {
        if let Ok(relative) = path.strip_prefix(&home) {
            return Path::new("~").join(relative).to_string_lossy().to_string();
        }
    }
    path.to_string_lossy().to_string()
}

fn segment_arguments(arguments: &[String], build: bool) -> Result<Segments, PodkernelError> {
    let mut sections: [Vec<String>; 3] = [Vec::new(), Vec::new(), Vec::new()];
    // Non-build templates have no build section, so parsing starts one further in.
    let mut current = if build { 0 } else { 1 };
    for argument in arguments {
        if argument == ARGUMENT_DELIMITER {
            if current + 1 >= sections.len() {
                let layout = if build {
                    "[build args] -- [run args] -- [command args]"
                } else {
                    "[run args] -- [command args]"
                };
                return Err(PodkernelError::Argument(format!(
                    "too many `--` separators; expected {layout}"
                )));
            }
            current += 1;
            continue;
        }
        sections[current].push(argument.clone());
    }
    let [build_args, run_args, cmd_args] = sections;
    Ok(Segments {
        build_args,
        run_args,
        cmd_args,
    })
}

fn validate_segments(segments: &Segments) -> Result<(), PodkernelError> {
    let mut rejected: Vec<String> = Vec::new();
    for value in &segments.build_args {
        if value == "--iidfile" || value.starts_with("--iidfile=") {
            rejected.push(format!("build argument {value}"));
        }
    }
    for value in &segments.run_args {
        if DISALLOWED_RUN_ARGS.contains(&value.as_str()) || value.starts_with("--rm=") {
            rejected.push(format!("run argument {value}"));
        }
    }
    if rejected.is_empty() {
        return Ok(());
    }
    Err(PodkernelError::Argument(format!(
        "{} would conflict with arguments injected at launch",
        rejected.join(", ")
    )))
}

fn sanitize_kernel_id(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

// An empty id joins to the store root and `.`/`..` survive sanitizing, so
// any of them would name the store itself or its parent instead of a
// per-kernel directory.
fn is_kernel_id(id: &str) -> bool {
    !id.is_empty() && id != "." && id != ".."
}

fn read_connection_ports(path: &Path) -> Result<BTreeSet<u16>, PodkernelError> {
    let content = fs::read_to_string(path).map_err(|err| {
        PodkernelError::ConnectionFile(format!("unable to read {}: {err}", path.display()))
    })?;
    let ports: ConnectionPorts = serde_json::from_str(&content).map_err(|err| {
        PodkernelError::ConnectionFile(format!("invalid connection file {}: {err}", path.display()))
    })?;
    Ok(ports.as_set())
}

fn substitute_connection_path(argument: &str) -> String {
    argument.replace(CONNECTION_FILE_TEMPLATE, CONTAINER_CONNECTION_PATH)
}

fn build_command(template: &LaunchTemplate, context_dir: &Path, iidfile: &Path) -> Vec<String> {
    let mut args = vec!["build".to_string()];
    args.extend(template.build_args.iter().cloned());
    args.push("--iidfile".to_string());
    args.push(iidfile.to_string_lossy().to_string());
    args.push(context_dir.to_string_lossy().to_string());
    args
}

fn run_command(template: &LaunchTemplate, injections: &InjectionSet) -> Vec<String> {
    let container_path = CONTAINER_CONNECTION_PATH;
    let mut args = vec!["run".to_string()];
    args.extend(template.run_args.iter().cloned());
    args.push("--rm".to_string());
    args.push("--cidfile".to_string());
    args.push(injections.cidfile.to_string_lossy().to_string());
    for env_var in CONNECTION_FILE_ENV_VARS {
        args.push("--env".to_string());
        args.push(format!("{env_var}={container_path}"));
    }
    for port in &injections.ports {
        args.push("--publish".to_string());
        args.push(format!("{port}:{port}"));
    }
    args.push("--volume".to_string());
    args.push(format!(
        "{}:{container_path}:ro",
        injections.connection_file.to_string_lossy()
    ));
    match &injections.image_id {
        Some(image_id) => args.push(image_id.clone()),
        None => args.push(template.image_name.clone()),
    }
    for cmd_arg in &template.cmd_args {
        args.push(substitute_connection_path(cmd_arg));
    }
    args
}

fn resolve_runtime_exe(container_command: &str) -> Result<PathBuf, PodkernelError> {
    which::which(container_command).map_err(|_| {
        PodkernelError::Launch(format!(
            "container runtime `{container_command}` not found on PATH; install podman or docker, or set --container-command"
        ))
    })
}

fn resolve_build_context(raw: &str) -> Result<String, PodkernelError> {
    let context_dir = fs::canonicalize(Path::new(raw)).map_err(|err| {
        PodkernelError::Argument(format!("build context {raw} is not usable: {err}"))
    })?;
    if !context_dir.is_dir() {
        return Err(PodkernelError::Argument(format!(
            "build context {} is not a directory",
            context_dir.display()
        )));
    }
    Ok(relativize_home_path(&context_dir))
}

fn handle_install(
    ctx: &Context,
    build: bool,
    display_name: Option<String>,
    language: String,
    image_name: Option<String>,
    arguments: &[String],
) -> Result<i32, PodkernelError> {
    let image_name = match image_name {
        Some(name) if !name.trim().is_empty() => name,
        _ => {
            let what = if build {
                "a build context directory"
            } else {
                "an image reference"
            };
            return Err(PodkernelError::Argument(format!("{what} is required")));
        }
    };
    let image_name = if build {
        resolve_build_context(&image_name)?
    } else {
        image_name
    };

    let display_name = match display_name {
        Some(name) => name,
        None => {
            let name = if build {
                Path::new(&image_name)
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_else(|| image_name.clone())
            } else {
                image_name.clone()
            };
            format!("{name} ({language})")
        }
    };

    let segments = segment_arguments(arguments, build)?;
    validate_segments(&segments)?;
    if segments.cmd_args.is_empty() {
        return Err(PodkernelError::Argument(
            "command arguments are required; pass the in-container kernel command after the final `--`"
                .to_string(),
        ));
    }

    let kernel_id = sanitize_kernel_id(&display_name);
    if !is_kernel_id(&kernel_id) {
        return Err(PodkernelError::Argument(format!(
            "display name {display_name:?} does not produce a usable kernel id"
        )));
    }
    let template = LaunchTemplate {
        image_name,
        build,
        build_args: segments.build_args,
        run_args: segments.run_args,
        cmd_args: segments.cmd_args,
    };
    let spec = KernelSpec {
        argv: vec![
            NAMESPACE.to_string(),
            "start".to_string(),
            kernel_id.clone(),
            CONNECTION_FILE_TEMPLATE.to_string(),
        ],
        display_name: display_name.clone(),
        language,
        interrupt_mode: InterruptMode::Message,
        env: None,
        metadata: KernelSpecMetadata {
            podkernel: template,
        },
    };

    let spec_path = ctx.kernel_dir.join(&kernel_id).join(KERNEL_SPEC_FILENAME);
    let content = serde_json::to_string_pretty(&spec)?;
    write_atomic_text_file(&spec_path, &content)?;
    info!("installed kernel {kernel_id}");
    output(
        ctx,
        json!({"kernel_id": kernel_id, "display_name": display_name, "path": spec_path}),
    )?;
    Ok(0)
}

fn handle_start<R: RuntimeRunner>(
    ctx: &Context,
    runner: &R,
    kernel_id: &str,
    connection_file: &Path,
) -> Result<i32, PodkernelError> {
    let spec = read_kernel_spec(&ctx.kernel_dir, kernel_id)?;
    let template = &spec.metadata.podkernel;
    let runtime_exe = resolve_runtime_exe(&ctx.container_command)?;

    let connection_file = fs::canonicalize(connection_file).map_err(|err| {
        PodkernelError::ConnectionFile(format!(
            "unable to resolve {}: {err}",
            connection_file.display()
        ))
    })?;
    let ports = read_connection_ports(&connection_file)?;

    let scratch = tempfile::Builder::new()
        .prefix(&format!("{NAMESPACE}.{kernel_id}."))
        .tempdir()?;
    // The runtime refuses to start when the cidfile already exists, so only the
    // path is created here.
    let cidfile = scratch.path().join("cid");

    let image_id = if template.build {
        Some(run_build(runner, &runtime_exe, template, scratch.path())?)
    } else {
        None
    };

    let injections = InjectionSet {
        connection_file,
        ports,
        cidfile: cidfile.clone(),
        image_id,
    };
    let run_args = run_command(template, &injections);

    register_stop_forwarding(&runtime_exe, &cidfile);

    info!("starting container for kernel {kernel_id}");
    debug!("run command: {} {}", runtime_exe.display(), run_args.join(" "));
    let outcome = runner.run(&runtime_exe, &run_args, false).map_err(|err| {
        PodkernelError::Launch(format!("failed to start container runtime: {err}"))
    })?;
    info!("container exited with status {}", outcome.status_code);
    Ok(outcome.status_code)
}

fn run_build<R: RuntimeRunner>(
    runner: &R,
    runtime_exe: &Path,
    template: &LaunchTemplate,
    scratch_dir: &Path,
) -> Result<String, PodkernelError> {
    let context_dir = expand_home_path(&template.image_name);
    let iidfile = scratch_dir.join("iid");
    let build_args = build_command(template, &context_dir, &iidfile);
    info!("building image from {}", context_dir.display());
    debug!(
        "build command: {} {}",
        runtime_exe.display(),
        build_args.join(" ")
    );
    let outcome = runner.run(runtime_exe, &build_args, false).map_err(|err| {
        PodkernelError::Launch(format!("failed to start container runtime: {err}"))
    })?;
    if !outcome.success() {
        return Err(PodkernelError::Build {
            message: format!("image build exited with status {}", outcome.status_code),
            status_code: outcome.status_code,
        });
    }
    let image_id = fs::read_to_string(&iidfile)
        .map_err(|err| PodkernelError::Build {
            message: format!("build succeeded but the image id file was unreadable: {err}"),
            status_code: 1,
        })?
        .trim()
        .to_string();
    if image_id.is_empty() {
        return Err(PodkernelError::Build {
            message: "build succeeded but the image id file was empty".to_string(),
            status_code: 1,
        });
    }
    debug!("built image {image_id}");
    Ok(image_id)
}

fn register_stop_forwarding(runtime_exe: &Path, cidfile: &Path) {
    let exe = runtime_exe.to_path_buf();
    let cidfile = cidfile.to_path_buf();
    if let Err(err) = ctrlc::set_handler(move || {
        forward_stop(&exe, &cidfile);
    }) {
        warn!("unable to register termination forwarding: {err}");
    }
}

fn forward_stop(exe: &Path, cidfile: &Path) {
    let Ok(container_id) = fs::read_to_string(cidfile) else {
        return;
    };
    let container_id = container_id.trim();
    if container_id.is_empty() {
        return;
    }
    info!("forwarding termination to container {container_id}");
    let _ = Command::new(exe)
        .arg("stop")
        .arg("--time")
        .arg(STOP_GRACE_SECONDS.to_string())
        .arg(container_id)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
}

fn handle_build<R: RuntimeRunner>(
    ctx: &Context,
    runner: &R,
    kernel_id: &str,
) -> Result<i32, PodkernelError> {
    let spec = read_kernel_spec(&ctx.kernel_dir, kernel_id)?;
    let template = &spec.metadata.podkernel;
    let runtime_exe = resolve_runtime_exe(&ctx.container_command)?;

    let image_id = if template.build {
        let scratch = tempfile::Builder::new()
            .prefix(&format!("{NAMESPACE}.{kernel_id}."))
            .tempdir()?;
        run_build(runner, &runtime_exe, template, scratch.path())?
    } else {
        resolve_image_id(runner, &runtime_exe, &template.image_name)?
    };

    if ctx.json {
        let payload = JsonResult {
            ok: true,
            result: Some(json!({"image_id": image_id})),
            error: None,
        };
        print_json(&payload)?;
    } else {
        println!("{}", style(&image_id).green());
    }
    Ok(0)
}

fn resolve_image_id<R: RuntimeRunner>(
    runner: &R,
    runtime_exe: &Path,
    image_name: &str,
) -> Result<String, PodkernelError> {
    if let Some(image_id) = inspect_image_id(runner, runtime_exe, image_name)? {
        return Ok(image_id);
    }
    info!("image {image_name} not found locally; pulling");
    let pull_args = vec!["pull".to_string(), image_name.to_string()];
    let outcome = runner.run(runtime_exe, &pull_args, false).map_err(|err| {
        PodkernelError::Launch(format!("failed to start container runtime: {err}"))
    })?;
    if !outcome.success() {
        return Err(PodkernelError::Build {
            message: format!("pulling {image_name} exited with status {}", outcome.status_code),
            status_code: outcome.status_code,
        });
    }
    inspect_image_id(runner, runtime_exe, image_name)?.ok_or_else(|| PodkernelError::Build {
        message: format!("image {image_name} not found after pull"),
        status_code: 1,
    })
}

fn inspect_image_id<R: RuntimeRunner>(
    runner: &R,
    runtime_exe: &Path,
    image_name: &str,
) -> Result<Option<String>, PodkernelError> {
    let inspect_args = vec!["inspect".to_string(), image_name.to_string()];
    let outcome = runner.run(runtime_exe, &inspect_args, true).map_err(|err| {
        PodkernelError::Launch(format!("failed to start container runtime: {err}"))
    })?;
    // The runtime exits non-zero for unknown images but still prints a JSON
    // array, so the output is parsed regardless of the status code.
    let parsed: serde_json::Value = match serde_json::from_slice(&outcome.stdout) {
        Ok(value) => value,
        Err(_) => {
            debug!(
                "inspect output was not json: {}",
                String::from_utf8_lossy(&outcome.stderr).trim()
            );
            return Ok(None);
        }
    };
    let image_id = parsed
        .get(0)
        .and_then(|entry| entry.get("Id"))
        .and_then(|id| id.as_str())
        .map(|id| id.to_string());
    Ok(image_id)
}

fn handle_list(ctx: &Context) -> Result<i32, PodkernelError> {
    let kernels = list_installed_kernels(&ctx.kernel_dir)?;
    if ctx.json {
        let rows: Vec<serde_json::Value> = kernels
            .iter()
            .map(|(kernel_id, spec)| {
                json!({
                    "kernel_id": kernel_id,
                    "display_name": spec.display_name,
                    "language": spec.language,
                    "image_name": spec.metadata.podkernel.image_name,
                    "build": spec.metadata.podkernel.build,
                })
            })
            .collect();
        let payload = JsonResult {
            ok: true,
            result: Some(json!({"kernels": rows})),
            error: None,
        };
        print_json(&payload)?;
        return Ok(0);
    }
    for (kernel_id, spec) in &kernels {
        println!("{kernel_id}\t{}", spec.display_name);
    }
    Ok(0)
}

fn handle_delete(
    ctx: &Context,
    kernel_id: &str,
    yes: bool,
    dry_run: bool,
) -> Result<i32, PodkernelError> {
    let spec = read_kernel_spec(&ctx.kernel_dir, kernel_id)?;
    let kernel_dir = ctx.kernel_dir.join(kernel_id);

    if dry_run {
        output(
            ctx,
            json!({
                "kernel_id": kernel_id,
                "display_name": spec.display_name,
                "path": kernel_dir,
                "deleted": false,
                "dry_run": true,
            }),
        )?;
        return Ok(0);
    }

    if !yes {
        if !io::stdin().is_terminal() {
            return Err(PodkernelError::Argument(
                "delete requires --yes when not running interactively (or use --dry-run to preview)"
                    .to_string(),
            ));
        }
        let theme = ColorfulTheme::default();
        let confirmed = Confirm::with_theme(&theme)
            .with_prompt(format!("Delete kernel {kernel_id} ({})?", spec.display_name))
            .default(false)
            .interact()?;
        if !confirmed {
            output(ctx, json!({"kernel_id": kernel_id, "deleted": false}))?;
            return Ok(0);
        }
    }

    fs::remove_dir_all(&kernel_dir)?;
    info!("removed kernel {kernel_id}");
    output(ctx, json!({"kernel_id": kernel_id, "deleted": true}))?;
    Ok(0)
}

fn handle_doctor<R: RuntimeRunner>(ctx: &Context, runner: &R) -> Result<i32, PodkernelError> {
    let mut checks = BTreeMap::new();

    let runtime_path = which::which(&ctx.container_command).ok();
    checks.insert("runtime_on_path".to_string(), runtime_path.is_some());

    let runtime_ok = match &runtime_path {
        Some(exe) => runner
            .run(exe, &["info".to_string()], true)
            .map(|outcome| outcome.success())
            .unwrap_or(false),
        None => false,
    };
    checks.insert("runtime_reachable".to_string(), runtime_ok);

    let store_ok = fs::create_dir_all(&ctx.kernel_dir)
        .and_then(|_| {
            let test_path = ctx.kernel_dir.join(".podkernel_write_test");
            fs::write(&test_path, b"ok")?;
            fs::remove_file(&test_path)?;
            Ok(())
        })
        .is_ok();
    checks.insert("kernel_store_writable".to_string(), store_ok);

    let ok = runtime_ok && store_ok;
    let error = if ok {
        None
    } else if !runtime_ok {
        Some(format!("{} is not available", ctx.container_command))
    } else {
        Some("kernel spec store is not writable".to_string())
    };

    if ctx.json {
        let payload = JsonResult {
            ok,
            result: Some(json!({"checks": checks})),
            error,
        };
        print_json(&payload)?;
        return Ok(0);
    }

    println!(
        "Runtime ({}): {}",
        ctx.container_command,
        if runtime_ok { "ok" } else { "missing or not running" }
    );
    println!(
        "Kernel store ({}): {}",
        ctx.kernel_dir.display(),
        if store_ok { "writable" } else { "not writable" }
    );
    if !runtime_ok {
        return Err(PodkernelError::Launch(format!(
            "{} is not available",
            ctx.container_command
        )));
    }
    if !store_ok {
        return Err(PodkernelError::Launch(
            "kernel spec store is not writable".to_string(),
        ));
    }
    Ok(0)
}

fn read_kernel_spec(kernel_dir: &Path, kernel_id: &str) -> Result<KernelSpec, PodkernelError> {
    if !is_kernel_id(kernel_id) {
        return Err(PodkernelError::KernelSpec(format!(
            "{kernel_id:?} is not a kernel id"
        )));
    }
    let spec_path = kernel_dir.join(kernel_id).join(KERNEL_SPEC_FILENAME);
    if !spec_path.exists() {
        return Err(PodkernelError::KernelSpec(format!(
            "no installed kernel with id {kernel_id}"
        )));
    }
    let content = fs::read_to_string(&spec_path)?;
    let spec: KernelSpec = serde_json::from_str(&content).map_err(|err| {
        PodkernelError::KernelSpec(format!(
            "{kernel_id} is not a podkernel kernel or its spec is unreadable: {err}"
        ))
    })?;
    Ok(spec)
}

fn list_installed_kernels(kernel_dir: &Path) -> Result<Vec<(String, KernelSpec)>, PodkernelError> {
    let mut kernels = Vec::new();
    if !kernel_dir.exists() {
        return Ok(kernels);
    }
    for entry in fs::read_dir(kernel_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let spec_path = entry.path().join(KERNEL_SPEC_FILENAME);
        if !spec_path.exists() {
            continue;
        }
        let content = fs::read_to_string(&spec_path)?;
        // Kernels installed by other tools fail the strict parse and are skipped.
        let Ok(spec) = serde_json::from_str::<KernelSpec>(&content) else {
            continue;
        };
        kernels.push((entry.file_name().to_string_lossy().to_string(), spec));
    }
    kernels.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(kernels)
}

fn ensure_parent(path: &Path) -> Result<(), PodkernelError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

fn write_atomic_text_file(path: &Path, content: &str) -> Result<(), PodkernelError> {
    ensure_parent(path)?;
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let pid = std::process::id();
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let tmp_path = parent.join(format!(
        ".{}.tmp.{}.{}",
        path.file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| NAMESPACE.to_string()),
        pid,
        ts
    ));

    fs::write(&tmp_path, content)?;
    fs::rename(&tmp_path, path)?;
    Ok(())
}

fn output(ctx: &Context, payload: serde_json::Value) -> Result<(), PodkernelError> {
    if ctx.json {
        let wrapper = JsonResult {
            ok: true,
            result: Some(payload),
            error: None,
        };
        print_json(&wrapper)?;
    } else {
        println!("{}", payload);
    }
    Ok(())
}

fn print_json<T: Serialize>(payload: &T) -> Result<(), PodkernelError> {
    let text = serde_json::to_string_pretty(payload)?;
    println!("{}", text);
    Ok(())
}
