//! Batch rewriting of compiled unit trees
//!
//! Build tooling rewrites a directory of compiled units ahead of time:
//!
//! 1. Walk the input tree; unit files become the worklist, everything else
//!    is carried along untouched.
//! 2. Resolve every worklist type, so that hierarchy errors surface before
//!    any unit is rewritten.
//! 3. Transform the units in parallel.
//! 4. Write the results in place, or mirror the whole tree into an output
//!    directory, copying non-unit files and unchanged units byte-for-byte.
//!
//! Types outside the tree are looked up on the auxiliary classpath.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::backend::loader::{CompositeLoader, DirectoryLoader, ResourceLoader};
use crate::backend::transform::{ScopeId, ScopeTransformer, TransformError};
use crate::config::{BatchConfig, FailMode, TransformConfig};

/// Errors that abort a batch run.
#[derive(Debug)]
pub enum BatchError {
    /// The input is not a directory.
    InvalidInput(PathBuf),
    Io { path: PathBuf, source: std::io::Error },
    /// A unit failed in fail-closed mode, or failed fatally.
    Transform { name: String, source: TransformError },
    /// The worker pool could not be created.
    Pool(String),
}

impl fmt::Display for BatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidInput(path) => write!(f, "{} is not a directory", path.display()),
            Self::Io { path, source } => write!(f, "I/O error on {}: {}", path.display(), source),
            Self::Transform { name, source } => write!(f, "Cannot transform {}: {}", name, source),
            Self::Pool(reason) => write!(f, "Cannot start worker pool: {}", reason),
        }
    }
}

impl std::error::Error for BatchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Transform { source, .. } => Some(source),
            _ => None,
        }
    }
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> BatchError + '_ {
    move |source| BatchError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Outcome of a batch run
#[derive(Debug, Default)]
pub struct BatchReport {
    /// Units written in transformed form
    pub rewritten: Vec<String>,
    /// Units that needed no transformation
    pub unchanged: Vec<String>,
    /// Non-unit files copied to the output tree
    pub copied: usize,
    /// Units kept verbatim because their transformation failed
    pub failed: Vec<(String, TransformError)>,
}

impl BatchReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn units(&self) -> usize {
        self.rewritten.len() + self.unchanged.len() + self.failed.len()
    }
}

/// One compiled unit of the worklist
#[derive(Debug, Clone)]
struct Unit {
    name: String,
    relative: PathBuf,
}

enum Outcome {
    Rewritten(Vec<u8>),
    Unchanged,
    Failed(TransformError),
}

/// Rewrites a directory of compiled units
#[derive(Debug, Clone, Default)]
pub struct BatchRewriter {
    transform: TransformConfig,
    batch: BatchConfig,
    classpath: Vec<PathBuf>,
}

impl BatchRewriter {
    pub fn new(transform: TransformConfig, batch: BatchConfig) -> Self {
        Self {
            transform,
            batch,
            classpath: Vec::new(),
        }
    }

    /// Add a directory searched for types outside the input tree
    pub fn classpath(mut self, dir: impl Into<PathBuf>) -> Self {
        self.classpath.push(dir.into());
        self
    }

    /// Rewrite `input`; in place when `output` is `None`
    pub fn rewrite(&self, input: &Path, output: Option<&Path>) -> Result<BatchReport, BatchError> {
        if !input.is_dir() {
            return Err(BatchError::InvalidInput(input.to_path_buf()));
        }
        let tree = DirectoryLoader::with_extension(input, &self.batch.extension);
        let (units, others) = self.scan(&tree)?;
        info!(
            target: "replayflow::batch",
            input = %input.display(),
            units = units.len(),
            other_files = others.len(),
            "batch started"
        );

        let scope = self.scope(tree);
        self.prepass(&scope, &units)?;

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.batch.effective_threads())
            .build()
            .map_err(|e| BatchError::Pool(e.to_string()))?;
        let outcomes: Vec<Outcome> = pool.install(|| {
            units
                .par_iter()
                .map(|unit| self.process(&scope, input, unit))
                .collect::<Result<_, _>>()
        })?;

        let mut report = BatchReport::default();
        let target = output.unwrap_or(input);
        for (unit, outcome) in units.iter().zip(outcomes) {
            let destination = target.join(&unit.relative);
            match outcome {
                Outcome::Rewritten(bytes) => {
                    write_file(&destination, &bytes)?;
                    report.rewritten.push(unit.name.clone());
                }
                Outcome::Unchanged => {
                    if output.is_some() {
                        copy_file(&input.join(&unit.relative), &destination)?;
                    }
                    report.unchanged.push(unit.name.clone());
                }
                Outcome::Failed(err) => {
                    if output.is_some() {
                        copy_file(&input.join(&unit.relative), &destination)?;
                    }
                    report.failed.push((unit.name.clone(), err));
                }
            }
        }
        if let Some(output) = output {
            for relative in &others {
                copy_file(&input.join(relative), &output.join(relative))?;
                report.copied += 1;
            }
        }

        info!(
            target: "replayflow::batch",
            rewritten = report.rewritten.len(),
            unchanged = report.unchanged.len(),
            failed = report.failed.len(),
            copied = report.copied,
            "batch finished"
        );
        Ok(report)
    }

    fn scope(&self, tree: DirectoryLoader) -> ScopeTransformer {
        let mut loader = CompositeLoader::new().with(Arc::new(tree));
        for dir in &self.classpath {
            loader.push(Arc::new(DirectoryLoader::with_extension(dir, &self.batch.extension)));
        }
        ScopeTransformer::new(
            ScopeId::new("batch"),
            Arc::new(loader) as Arc<dyn ResourceLoader>,
            &self.transform,
        )
    }

    /// Split the tree into units and other files, both in path order
    fn scan(&self, tree: &DirectoryLoader) -> Result<(Vec<Unit>, Vec<PathBuf>), BatchError> {
        let mut files = Vec::new();
        walk(tree.root(), &mut files)?;
        files.sort();

        let mut units = Vec::new();
        let mut others = Vec::new();
        for path in files {
            let relative = path
                .strip_prefix(tree.root())
                .map(Path::to_path_buf)
                .unwrap_or_else(|_| path.clone());
            match tree.name_for_path(&path) {
                Some(name) => units.push(Unit { name, relative }),
                None => others.push(relative),
            }
        }
        Ok((units, others))
    }

    /// Resolve every unit before anything is transformed
    fn prepass(&self, scope: &ScopeTransformer, units: &[Unit]) -> Result<(), BatchError> {
        for unit in units {
            if let Err(err) = scope.resolver().resolve(&unit.name) {
                let err = TransformError::from(err);
                if err.is_fatal() || self.transform.fail_mode == FailMode::Closed {
                    return Err(BatchError::Transform {
                        name: unit.name.clone(),
                        source: err,
                    });
                }
                debug!(target: "replayflow::batch", name = %unit.name, error = %err, "unresolvable unit");
            }
        }
        Ok(())
    }

    fn process(&self, scope: &ScopeTransformer, input: &Path, unit: &Unit) -> Result<Outcome, BatchError> {
        let path = input.join(&unit.relative);
        let bytes = std::fs::read(&path).map_err(io_error(&path))?;
        match scope.transform(&unit.name, &bytes) {
            Ok(Some(rewritten)) => Ok(Outcome::Rewritten(rewritten)),
            Ok(None) => Ok(Outcome::Unchanged),
            Err(err) if err.is_fatal() || self.transform.fail_mode == FailMode::Closed => {
                Err(BatchError::Transform {
                    name: unit.name.clone(),
                    source: err,
                })
            }
            Err(err) => {
                warn!(target: "replayflow::batch", name = %unit.name, error = %err, "kept unchanged");
                Ok(Outcome::Failed(err))
            }
        }
    }
}

fn walk(dir: &Path, files: &mut Vec<PathBuf>) -> Result<(), BatchError> {
    for entry in std::fs::read_dir(dir).map_err(io_error(dir))? {
        let entry = entry.map_err(io_error(dir))?;
        let path = entry.path();
        let file_type = entry.file_type().map_err(io_error(&path))?;
        if file_type.is_dir() {
            walk(&path, files)?;
        } else if file_type.is_file() {
            files.push(path);
        }
    }
    Ok(())
}

fn write_file(path: &Path, bytes: &[u8]) -> Result<(), BatchError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(io_error(parent))?;
    }
    std::fs::write(path, bytes).map_err(io_error(path))
}

fn copy_file(from: &Path, to: &Path) -> Result<(), BatchError> {
    if from == to {
        return Ok(());
    }
    if let Some(parent) = to.parent() {
        std::fs::create_dir_all(parent).map_err(io_error(parent))?;
    }
    std::fs::copy(from, to).map_err(io_error(from))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::bytecode::{encode_type, BodyBuilder, MethodDef, Opcode, ReturnKind, Signature, TypeDef};
    use crate::backend::runtime::SUSPEND;

    fn put(root: &Path, relative: &str, bytes: &[u8]) {
        let path = root.join(relative);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, bytes).unwrap();
    }

    fn generator(name: &str) -> TypeDef {
        let mut b = BodyBuilder::new();
        b.push_int(1).invoke_native(SUSPEND, 1).emit(Opcode::Pop).emit(Opcode::Return);
        TypeDef::new(name).with_method(MethodDef::new(Signature::new("run", 0, ReturnKind::Void), b.build()))
    }

    #[test]
    fn test_rejects_missing_input() {
        let rewriter = BatchRewriter::default();
        assert!(matches!(
            rewriter.rewrite(Path::new("/definitely/not/here"), None),
            Err(BatchError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_in_place_rewrites_only_units() {
        let dir = tempfile::tempdir().unwrap();
        put(dir.path(), "app/Gen.flow", &encode_type(&generator("app.Gen")));
        put(dir.path(), "app/notes.txt", b"keep me");

        let report = BatchRewriter::new(TransformConfig::default(), BatchConfig { threads: 2, ..Default::default() })
            .rewrite(dir.path(), None)
            .unwrap();
        assert_eq!(report.rewritten, vec!["app.Gen".to_string()]);
        assert_eq!(report.copied, 0);

        let bytes = std::fs::read(dir.path().join("app/Gen.flow")).unwrap();
        assert!(crate::backend::bytecode::decode_type(&bytes).unwrap().instrumented);
        assert_eq!(std::fs::read(dir.path().join("app/notes.txt")).unwrap(), b"keep me");
    }
}
