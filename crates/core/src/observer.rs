// Working-tree observation.
//
// The supervisor needs one thing from the repository: the set of paths that
// currently differ from HEAD, including untracked files. `git status
// --porcelain=v1` gives a stable, scriptable answer. Any failure to run or
// parse git degrades to "nothing dirty" so a broken git never blocks the
// supervised process.

use std::collections::BTreeSet;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::{debug, warn};

/// Output of one external command run.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
}

/// Seam for running external commands, mockable in tests.
pub trait CommandRunner: Send + Sync {
    fn run(&self, program: &str, args: &[&str], cwd: &Path) -> io::Result<CommandOutput>;
}

/// Real command runner backed by `std::process::Command`.
#[derive(Debug, Default, Clone)]
pub struct SystemCommandRunner;

impl CommandRunner for SystemCommandRunner {
    fn run(&self, program: &str, args: &[&str], cwd: &Path) -> io::Result<CommandOutput> {
        let output = Command::new(program).args(args).current_dir(cwd).output()?;
        Ok(CommandOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        })
    }
}

/// Source of "which paths are dirty right now".
pub trait DiffSource: Send {
    fn dirty_paths(&self) -> BTreeSet<String>;
}

/// Dirty-path observer backed by `git status`.
pub struct GitDiffObserver<R = SystemCommandRunner> {
    repo_root: PathBuf,
    runner: R,
}

impl GitDiffObserver<SystemCommandRunner> {
    pub fn new(repo_root: impl Into<PathBuf>) -> Self {
        Self { repo_root: repo_root.into(), runner: SystemCommandRunner }
    }
}

impl<R: CommandRunner> GitDiffObserver<R> {
    pub fn with_runner(repo_root: impl Into<PathBuf>, runner: R) -> Self {
        Self { repo_root: repo_root.into(), runner }
    }

    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }
}

impl<R: CommandRunner> DiffSource for GitDiffObserver<R> {
    fn dirty_paths(&self) -> BTreeSet<String> {
        let result = self.runner.run(
            "git",
            &["status", "--porcelain=v1", "--untracked-files=all"],
            &self.repo_root,
        );
        match result {
            Ok(output) if output.success => parse_porcelain(&output.stdout),
            Ok(_) => {
                warn!(root = %self.repo_root.display(), "git status failed; treating tree as clean");
                BTreeSet::new()
            }
            Err(error) => {
                warn!(?error, "could not run git status; treating tree as clean");
                BTreeSet::new()
            }
        }
    }
}

/// Parse `git status --porcelain=v1` output into a path set.
///
/// Each line is `XY <path>`, with renames as `XY <old> -> <new>`; we keep
/// the new side. Paths under `.git/` are ignored.
pub fn parse_porcelain(raw: &str) -> BTreeSet<String> {
    let mut paths = BTreeSet::new();
    for line in raw.lines() {
        if line.len() < 4 {
            continue;
        }
        let mut path = &line[3..];
        if let Some((_, renamed_to)) = path.split_once(" -> ") {
            path = renamed_to;
        }
        let path = path.trim().trim_matches('"');
        if path.is_empty() || path.starts_with(".git/") {
            continue;
        }
        paths.insert(path.to_string());
    }
    paths
}

/// Find the repository root via `git rev-parse --show-toplevel`, falling
/// back to the current directory when not inside a work tree.
pub fn resolve_repo_root(runner: &dyn CommandRunner, cwd: &Path) -> PathBuf {
    match runner.run("git", &["rev-parse", "--show-toplevel"], cwd) {
        Ok(output) if output.success => {
            let top = output.stdout.trim();
            if top.is_empty() {
                cwd.to_path_buf()
            } else {
                PathBuf::from(top)
            }
        }
        _ => {
            debug!(cwd = %cwd.display(), "not inside a git work tree; using cwd as root");
            cwd.to_path_buf()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::io;
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;

    use super::{
        parse_porcelain, resolve_repo_root, CommandOutput, CommandRunner, DiffSource,
        GitDiffObserver,
    };

    /// Scripted runner that records invocations and replays canned results.
    struct MockRunner {
        calls: Mutex<Vec<(String, Vec<String>, PathBuf)>>,
        results: Mutex<Vec<io::Result<CommandOutput>>>,
    }

    impl MockRunner {
        fn new(results: Vec<io::Result<CommandOutput>>) -> Self {
            Self { calls: Mutex::new(Vec::new()), results: Mutex::new(results) }
        }

        fn ok(stdout: &str) -> io::Result<CommandOutput> {
            Ok(CommandOutput { success: true, stdout: stdout.to_string() })
        }

        fn failed() -> io::Result<CommandOutput> {
            Ok(CommandOutput { success: false, stdout: String::new() })
        }
    }

    impl CommandRunner for MockRunner {
        fn run(&self, program: &str, args: &[&str], cwd: &Path) -> io::Result<CommandOutput> {
            self.calls.lock().expect("mock lock should work").push((
                program.to_string(),
                args.iter().map(|s| s.to_string()).collect(),
                cwd.to_path_buf(),
            ));
            self.results.lock().expect("mock lock should work").remove(0)
        }
    }

    fn set(paths: &[&str]) -> BTreeSet<String> {
        paths.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn porcelain_lines_become_paths() {
        let raw = " M src/auth.py\n?? src/new_file.py\nA  docs/notes.md\n";
        assert_eq!(parse_porcelain(raw), set(&["src/auth.py", "src/new_file.py", "docs/notes.md"]));
    }

    #[test]
    fn rename_lines_keep_the_new_side() {
        let raw = "R  src/old.py -> src/new.py\n";
        assert_eq!(parse_porcelain(raw), set(&["src/new.py"]));
    }

    #[test]
    fn short_lines_and_git_internals_are_skipped() {
        let raw = "??\n\n M .git/config\n M src/ok.py\n";
        assert_eq!(parse_porcelain(raw), set(&["src/ok.py"]));
    }

    #[test]
    fn quoted_paths_are_unwrapped() {
        let raw = "?? \"src/with space.py\"\n";
        assert_eq!(parse_porcelain(raw), set(&["src/with space.py"]));
    }

    #[test]
    fn observer_runs_git_status_in_the_repo_root() {
        let runner = MockRunner::new(vec![MockRunner::ok(" M src/a.py\n?? src/b.py\n")]);
        let observer = GitDiffObserver::with_runner("/repo", runner);

        assert_eq!(observer.dirty_paths(), set(&["src/a.py", "src/b.py"]));

        let calls = observer.runner.calls.lock().expect("mock lock should work");
        assert_eq!(calls.len(), 1);
        let (program, args, cwd) = &calls[0];
        assert_eq!(program, "git");
        assert_eq!(args, &["status", "--porcelain=v1", "--untracked-files=all"]);
        assert_eq!(cwd, &PathBuf::from("/repo"));
    }

    #[test]
    fn failed_git_yields_empty_set() {
        let runner = MockRunner::new(vec![MockRunner::failed()]);
        let observer = GitDiffObserver::with_runner("/repo", runner);
        assert!(observer.dirty_paths().is_empty());
    }

    #[test]
    fn io_error_yields_empty_set() {
        let runner =
            MockRunner::new(vec![Err(io::Error::new(io::ErrorKind::NotFound, "no git"))]);
        let observer = GitDiffObserver::with_runner("/repo", runner);
        assert!(observer.dirty_paths().is_empty());
    }

    #[test]
    fn repo_root_comes_from_rev_parse() {
        let runner = MockRunner::new(vec![MockRunner::ok("/work/checkout\n")]);
        let root = resolve_repo_root(&runner, Path::new("/work/checkout/src"));
        assert_eq!(root, PathBuf::from("/work/checkout"));
    }

    #[test]
    fn repo_root_falls_back_to_cwd() {
        let runner = MockRunner::new(vec![MockRunner::failed()]);
        let root = resolve_repo_root(&runner, Path::new("/somewhere"));
        assert_eq!(root, PathBuf::from("/somewhere"));
    }
}
