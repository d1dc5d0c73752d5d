//! Backend that drives external programs.
//!
//! Three configurable command lines:
//! - `bundle_command` compiles a composition source into a bundle directory
//!   (optional; without it the source file itself is the bundle entry),
//! - `engine_command` starts the long-lived render engine, which announces its
//!   endpoint on the first stdout line (optional),
//! - `render_command` renders one job and reports progress on stdout.
//!
//! Arguments may contain `{source}`, `{bundle}`, `{props}`, `{output}`,
//! `{width}`, `{height}`, `{fps}`, `{frames}` and `{engine}` placeholders.
//! When `sandbox_command` is set it prefixes the bundle and render commands,
//! and inline composition sources are accepted.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::ChildStdout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::progress::parse_progress_line;
use super::{CompileUnit, EngineInstance, RenderBackend, RenderInvocation, RenderOutput};
use crate::compile::CompiledArtifact;
use crate::domain::OutputGeometry;
use crate::utils::fs;
use crate::{Error, Result};

/// Lines of stderr kept for error messages.
const STDERR_TAIL_LINES: usize = 20;

/// Configuration for [`CommandBackend`].
#[derive(Debug, Clone)]
pub struct CommandBackendConfig {
    pub bundle_command: Vec<String>,
    pub engine_command: Vec<String>,
    pub render_command: Vec<String>,
    pub sandbox_command: Vec<String>,
    /// Parent directory for compiled bundles.
    pub bundles_dir: PathBuf,
    /// Private scratch directory for per-job render props. Never served.
    pub work_dir: PathBuf,
    /// How long the engine may take to announce its endpoint.
    pub engine_startup_timeout: Duration,
    /// How long a killed child may take to exit.
    pub kill_grace: Duration,
}

impl Default for CommandBackendConfig {
    fn default() -> Self {
        Self {
            bundle_command: process_utils::split_command_line(
                "npx remotion bundle {source} --out-dir={bundle}",
            ),
            engine_command: Vec::new(),
            render_command: process_utils::split_command_line(
                "npx remotion render {bundle} Main {output} --props={props} --width={width} --height={height} --fps={fps} --frames=0-{frames}",
            ),
            sandbox_command: Vec::new(),
            bundles_dir: PathBuf::from("./data/bundles"),
            work_dir: PathBuf::from("./data/work"),
            engine_startup_timeout: Duration::from_secs(30),
            kill_grace: Duration::from_secs(5),
        }
    }
}

struct CommandOutcome {
    status: ExitStatus,
    stderr_tail: Vec<String>,
}

impl CommandOutcome {
    fn describe(&self) -> String {
        if self.stderr_tail.is_empty() {
            format!("exited with {}", self.status)
        } else {
            format!("exited with {}: {}", self.status, self.stderr_tail.join("\n"))
        }
    }
}

/// Render backend that shells out to configured programs.
pub struct CommandBackend {
    config: CommandBackendConfig,
}

impl CommandBackend {
    pub fn new(config: CommandBackendConfig) -> Result<Self> {
        if config.render_command.is_empty() {
            return Err(Error::config("render command must not be empty"));
        }
        Ok(Self { config })
    }

    pub fn config(&self) -> &CommandBackendConfig {
        &self.config
    }

    /// Expand a command line, prefixed with the sandbox wrapper if configured.
    fn argv(&self, command: &[String], values: &[(&str, &str)]) -> Vec<String> {
        let mut argv = process_utils::expand_placeholders(&self.config.sandbox_command, values);
        argv.extend(process_utils::expand_placeholders(command, values));
        argv
    }

    /// Write render props to a private temp file under `work_dir`.
    async fn write_props(
        &self,
        job_id: &str,
        props: &serde_json::Value,
    ) -> Result<tempfile::NamedTempFile> {
        fs::ensure_dir_all_with_op("creating work directory", &self.config.work_dir).await?;
        let file = tempfile::Builder::new()
            .prefix(&format!("{job_id}-"))
            .suffix(".props.json")
            .tempfile_in(&self.config.work_dir)
            .map_err(|e| Error::io_path("creating render props", &self.config.work_dir, e))?;
        tokio::fs::write(file.path(), serde_json::to_vec(props)?)
            .await
            .map_err(|e| Error::io_path("writing render props", file.path(), e))?;
        Ok(file)
    }

    /// Run a command to completion, feeding each stdout line to `on_stdout`.
    ///
    /// Returns `None` when `cancel` fired; the child is killed in that case.
    async fn run<F>(
        &self,
        argv: &[String],
        cancel: &CancellationToken,
        mut on_stdout: F,
    ) -> Result<Option<CommandOutcome>>
    where
        F: FnMut(&str) + Send,
    {
        let mut command = process_utils::tokio_command_from_argv(argv)
            .ok_or_else(|| Error::config("command line is empty"))?;
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());

        let program = argv.first().map(String::as_str).unwrap_or_default();
        let mut child = command
            .spawn()
            .map_err(|e| Error::Other(format!("Failed to spawn '{program}': {e}")))?;
        debug!(program, pid = child.id(), "Spawned command");

        let stderr_task = child.stderr.take().map(|stderr| {
            tokio::spawn(async move {
                let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("stderr: {}", line);
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
                Vec::from(tail)
            })
        });

        let mut stdout = child.stdout.take().map(|s| BufReader::new(s).lines());

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    process_utils::terminate(&mut child, self.config.kill_grace).await;
                    if let Some(task) = &stderr_task {
                        task.abort();
                    }
                    return Ok(None);
                }
                line = next_line(&mut stdout) => match line {
                    Some(line) => {
                        debug!("stdout: {}", line);
                        on_stdout(&line);
                    }
                    None => break,
                }
            }
        }

        let status = tokio::select! {
            _ = cancel.cancelled() => {
                process_utils::terminate(&mut child, self.config.kill_grace).await;
                if let Some(task) = &stderr_task {
                    task.abort();
                }
                return Ok(None);
            }
            status = child.wait() => status
                .map_err(|e| Error::Other(format!("Failed to wait for '{program}': {e}")))?,
        };

        let stderr_tail = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => Vec::new(),
        };

        Ok(Some(CommandOutcome {
            status,
            stderr_tail,
        }))
    }
}

async fn next_line(lines: &mut Option<Lines<BufReader<ChildStdout>>>) -> Option<String> {
    match lines {
        Some(lines) => lines.next_line().await.ok().flatten(),
        None => None,
    }
}

fn geometry_values(geometry: &OutputGeometry) -> [(&'static str, String); 4] {
    [
        ("width", geometry.width.to_string()),
        ("height", geometry.height.to_string()),
        ("fps", geometry.fps.to_string()),
        ("frames", geometry.duration_frames.to_string()),
    ]
}

#[async_trait]
impl RenderBackend for CommandBackend {
    fn name(&self) -> &'static str {
        "command"
    }

    fn supports_inline_source(&self) -> bool {
        !self.config.sandbox_command.is_empty()
    }

    async fn compile(&self, unit: &CompileUnit) -> Result<CompiledArtifact> {
        let bundle_dir = self.config.bundles_dir.join(format!(
            "{}-{}",
            unit.key.short(),
            uuid::Uuid::new_v4().simple()
        ));
        fs::ensure_dir_all_with_op("creating bundle directory", &bundle_dir).await?;

        let source_path = bundle_dir.join(&unit.file_name);
        let entry_point = if self.config.bundle_command.is_empty() {
            source_path.clone()
        } else {
            bundle_dir.clone()
        };
        // Owns the directory from here on, so every failure below cleans it up.
        let artifact =
            CompiledArtifact::new(unit.key.clone(), &bundle_dir, entry_point).remove_on_drop();

        tokio::fs::write(&source_path, &unit.source)
            .await
            .map_err(|e| Error::io_path("writing composition source", &source_path, e))?;

        if self.config.bundle_command.is_empty() {
            return Ok(artifact);
        }

        let source = source_path.to_string_lossy();
        let bundle = bundle_dir.to_string_lossy();
        let geometry = geometry_values(&unit.geometry);
        let mut values = vec![("source", source.as_ref()), ("bundle", bundle.as_ref())];
        values.extend(geometry.iter().map(|(k, v)| (*k, v.as_str())));

        let argv = self.argv(&self.config.bundle_command, &values);
        info!(key = %unit.key.short(), composition = %unit.label, "Running bundler");

        let outcome = self
            .run(&argv, &CancellationToken::new(), |_| {})
            .await
            .map_err(|e| Error::compile(e.to_string()))?
            .ok_or_else(|| Error::compile("bundler was cancelled"))?;

        if !outcome.status.success() {
            return Err(Error::compile(format!("bundler {}", outcome.describe())));
        }

        Ok(artifact)
    }

    async fn launch(&self) -> Result<EngineInstance> {
        if self.config.engine_command.is_empty() {
            return Ok(EngineInstance::detached(None));
        }

        let mut command = process_utils::tokio_command_from_argv(&self.config.engine_command)
            .ok_or_else(|| Error::config("engine command is empty"))?;
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());

        let mut child = command
            .spawn()
            .map_err(|e| Error::render(format!("Failed to start render engine: {e}")))?;

        let Some(stdout) = child.stdout.take() else {
            process_utils::terminate(&mut child, self.config.kill_grace).await;
            return Err(Error::render("render engine stdout is not captured"));
        };
        let mut lines = BufReader::new(stdout).lines();

        let announced =
            tokio::time::timeout(self.config.engine_startup_timeout, lines.next_line()).await;
        let endpoint = match announced {
            Ok(Ok(Some(line))) if !line.trim().is_empty() => line.trim().to_string(),
            Ok(Ok(_)) => {
                process_utils::terminate(&mut child, self.config.kill_grace).await;
                return Err(Error::render(
                    "render engine exited before announcing its endpoint",
                ));
            }
            Ok(Err(e)) => {
                process_utils::terminate(&mut child, self.config.kill_grace).await;
                return Err(Error::render(format!("Failed to read render engine output: {e}")));
            }
            Err(_) => {
                process_utils::terminate(&mut child, self.config.kill_grace).await;
                return Err(Error::render(format!(
                    "render engine did not announce its endpoint within {:?}",
                    self.config.engine_startup_timeout
                )));
            }
        };

        tokio::spawn(async move {
            while let Ok(Some(line)) = lines.next_line().await {
                debug!("engine stdout: {}", line);
            }
        });
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if line.to_lowercase().contains("error") {
                        warn!("engine stderr: {}", line);
                    } else {
                        debug!("engine stderr: {}", line);
                    }
                }
            });
        }

        info!(endpoint = %endpoint, pid = child.id(), "Render engine started");
        Ok(EngineInstance::with_process(child, Some(endpoint)))
    }

    async fn render(&self, invocation: RenderInvocation) -> Result<RenderOutput> {
        let RenderInvocation {
            job_id,
            artifact,
            engine,
            geometry,
            params,
            output_path,
            progress,
            cancel,
        } = invocation;

        let props = serde_json::json!({
            "clips": params.clips,
            "objects": params.objects,
            "texts": params.texts,
            "width": geometry.width,
            "height": geometry.height,
            "fps": geometry.fps,
            "durationInFrames": geometry.duration_frames,
        });
        // Removed on drop, including when the render future is abandoned.
        let props_file = self.write_props(&job_id, &props).await?;
        let props_path = props_file.path().to_path_buf();

        let source = artifact.entry_point().to_string_lossy();
        let bundle = artifact.bundle_dir().to_string_lossy();
        let props_arg = props_path.to_string_lossy();
        let output = output_path.to_string_lossy();
        let endpoint = engine.endpoint().unwrap_or_default();
        let geometry_args = geometry_values(&geometry);

        let mut values = vec![
            ("source", source.as_ref()),
            ("bundle", bundle.as_ref()),
            ("props", props_arg.as_ref()),
            ("output", output.as_ref()),
            ("engine", endpoint),
        ];
        values.extend(geometry_args.iter().map(|(k, v)| (*k, v.as_str())));
        let argv = self.argv(&self.config.render_command, &values);

        debug!(job_id = %job_id, engine = engine.id(), "Starting render command");
        let total_frames = geometry.duration_frames;
        let result = self
            .run(&argv, &cancel, |line| {
                if let Some(fraction) = parse_progress_line(line, total_frames) {
                    progress.report(fraction);
                }
            })
            .await;

        if let Err(e) = props_file.close() {
            warn!(job_id = %job_id, error = %e, "Failed to remove render props");
        }

        let outcome = match result? {
            Some(outcome) => outcome,
            None => return Err(Error::Cancelled),
        };

        if !outcome.status.success() {
            return Err(Error::render(format!("renderer {}", outcome.describe())));
        }

        match tokio::fs::metadata(&output_path).await {
            Ok(meta) if meta.is_file() => Ok(RenderOutput { path: output_path }),
            _ => Err(Error::render(format!(
                "renderer exited successfully but produced no output at {}",
                output_path.display()
            ))),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::backend::ProgressReporter;
    use crate::compile::CacheKey;
    use crate::domain::RenderParams;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    fn geometry() -> OutputGeometry {
        OutputGeometry {
            width: 1080,
            height: 1920,
            fps: 30,
            duration_frames: 150,
        }
    }

    fn config(dir: &std::path::Path) -> CommandBackendConfig {
        CommandBackendConfig {
            bundle_command: Vec::new(),
            engine_command: Vec::new(),
            render_command: sh("echo frame=75; echo progress=end; cp {props} {output}"),
            sandbox_command: Vec::new(),
            bundles_dir: dir.join("bundles"),
            work_dir: dir.join("work"),
            engine_startup_timeout: Duration::from_secs(5),
            kill_grace: Duration::from_secs(2),
        }
    }

    fn unit(source: &str) -> CompileUnit {
        CompileUnit {
            key: CacheKey::new(source, &geometry()),
            label: "promo".to_string(),
            source: source.to_string(),
            file_name: "composition.tsx".to_string(),
            geometry: geometry(),
            inline: false,
        }
    }

    fn invocation(
        artifact: Arc<CompiledArtifact>,
        output_path: PathBuf,
        progress: ProgressReporter,
        cancel: CancellationToken,
    ) -> RenderInvocation {
        RenderInvocation {
            job_id: "job-1".to_string(),
            artifact,
            engine: Arc::new(EngineInstance::detached(None)),
            geometry: geometry(),
            params: RenderParams::default(),
            output_path,
            progress,
            cancel,
        }
    }

    #[test]
    fn empty_render_command_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.render_command.clear();
        assert!(CommandBackend::new(cfg).is_err());
    }

    #[test]
    fn sandbox_enables_inline_source() {
        let dir = tempfile::tempdir().unwrap();
        let backend = CommandBackend::new(config(dir.path())).unwrap();
        assert!(!backend.supports_inline_source());

        let mut cfg = config(dir.path());
        cfg.sandbox_command = vec!["firejail".to_string(), "--quiet".to_string()];
        let backend = CommandBackend::new(cfg).unwrap();
        assert!(backend.supports_inline_source());
        assert_eq!(
            backend.argv(&["render".to_string(), "{output}".to_string()], &[("output", "/o.mp4")]),
            vec!["firejail", "--quiet", "render", "/o.mp4"]
        );
    }

    #[tokio::test]
    async fn compile_without_bundler_writes_source() {
        let dir = tempfile::tempdir().unwrap();
        let backend = CommandBackend::new(config(dir.path())).unwrap();

        let artifact = backend.compile(&unit("export default 1;")).await.unwrap();
        assert_eq!(
            std::fs::read_to_string(artifact.entry_point()).unwrap(),
            "export default 1;"
        );
    }

    #[tokio::test]
    async fn failing_bundler_is_a_compile_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.bundle_command = sh("echo boom >&2; exit 3");
        let backend = CommandBackend::new(cfg).unwrap();

        match backend.compile(&unit("bad")).await {
            Err(Error::Compile(message)) => assert!(message.contains("boom"), "{message}"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn bundler_receives_placeholders() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.bundle_command = sh("cp {source} {bundle}/index.js && echo {width}x{height} > {bundle}/size");
        let backend = CommandBackend::new(cfg).unwrap();

        let artifact = backend.compile(&unit("ok")).await.unwrap();
        let size = std::fs::read_to_string(artifact.bundle_dir().join("size")).unwrap();
        assert_eq!(size.trim(), "1080x1920");
        assert!(artifact.bundle_dir().join("index.js").exists());
    }

    #[tokio::test]
    async fn render_reports_progress_and_output() {
        let dir = tempfile::tempdir().unwrap();
        let backend = CommandBackend::new(config(dir.path())).unwrap();
        let artifact = Arc::new(backend.compile(&unit("ok")).await.unwrap());

        let (tx, mut rx) = tokio::sync::mpsc::channel(16);
        let progress = ProgressReporter::new("job-1", 150, tx);
        let output_path = dir.path().join("job-1.mp4");

        let output = backend
            .render(invocation(artifact, output_path.clone(), progress, CancellationToken::new()))
            .await
            .unwrap();
        assert_eq!(output.path, output_path);
        let rendered = std::fs::read_to_string(&output_path).unwrap();
        assert!(rendered.contains("durationInFrames"), "{rendered}");

        // Props live in the work dir, never next to the served outputs.
        assert!(!dir.path().join("job-1.props.json").exists());
        assert_eq!(std::fs::read_dir(dir.path().join("work")).unwrap().count(), 0);

        assert_eq!(rx.recv().await.unwrap().fraction, 0.5);
        assert_eq!(rx.recv().await.unwrap().fraction, 1.0);
    }

    #[tokio::test]
    async fn render_failure_carries_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.render_command = sh("echo 'clip not found' >&2; exit 1");
        let backend = CommandBackend::new(cfg).unwrap();
        let artifact = Arc::new(backend.compile(&unit("ok")).await.unwrap());

        let result = backend
            .render(invocation(
                artifact,
                dir.path().join("job-1.mp4"),
                ProgressReporter::noop("job-1"),
                CancellationToken::new(),
            ))
            .await;
        match result {
            Err(Error::Render(message)) => assert!(message.contains("clip not found")),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancellation_kills_the_render() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.render_command = sh("sleep 30");
        let backend = CommandBackend::new(cfg).unwrap();
        let artifact = Arc::new(backend.compile(&unit("ok")).await.unwrap());

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let result = backend
            .render(invocation(
                artifact,
                dir.path().join("job-1.mp4"),
                ProgressReporter::noop("job-1"),
                cancel,
            ))
            .await;
        assert!(matches!(result, Err(Error::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn engine_announces_endpoint() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.engine_command = sh("echo http://127.0.0.1:7777; sleep 30");
        let backend = CommandBackend::new(cfg).unwrap();

        let engine = backend.launch().await.unwrap();
        assert_eq!(engine.endpoint(), Some("http://127.0.0.1:7777"));
        assert!(engine.is_alive());
        engine.shutdown(Duration::from_secs(2)).await;
        assert!(!engine.is_alive());
    }

    #[tokio::test]
    async fn silent_engine_fails_to_launch() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.engine_command = sh("exit 0");
        let backend = CommandBackend::new(cfg).unwrap();
        assert!(matches!(backend.launch().await, Err(Error::Render(_))));
    }
}
