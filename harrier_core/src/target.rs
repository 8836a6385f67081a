use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TargetError {
    /// The target unit could not be loaded. Fatal: the loop never starts.
    #[error("Failed to load target module: {0}")]
    LoadFailed(String),
}

/// One exported callable of the loaded target.
///
/// `param_names` is the explicitly declared parameter list; the engine derives
/// the calling convention from it rather than from source-text heuristics.
/// `invoke` returns the callable's fault as an `Err` string; panics are caught
/// by the harness.
pub trait TargetCallable: Send + Sync {
    fn name(&self) -> &str;
    fn param_names(&self) -> &[String];
    fn invoke(&self, args: Vec<Value>) -> Result<Value, String>;
}

/// A dynamically loadable unit exposing zero or more named callables.
/// Every exported callable is treated as an independent fuzz target.
pub trait TargetModule: Send + Sync {
    /// Resolved identity of the unit, used to attribute coverage.
    fn path(&self) -> &Path;
    fn callables(&self) -> &[Arc<dyn TargetCallable>];
}

/// Loads a target module given an explicit context.
pub trait TargetLoader {
    fn load(&self, context: &TargetContext) -> Result<Box<dyn TargetModule>, TargetError>;
}

/// Explicit dependency object handed to the target-loading step.
///
/// Collaborators the target expects are carried in `stubs`, constructed once
/// at initialization rather than injected into ambient global state.
#[derive(Debug, Clone)]
pub struct TargetContext {
    pub corpus_dir: PathBuf,
    pub stubs: HashMap<String, Value>,
}

impl TargetContext {
    pub fn new(corpus_dir: PathBuf) -> Self {
        Self {
            corpus_dir,
            stubs: HashMap::new(),
        }
    }

    pub fn with_stub(mut self, name: &str, value: Value) -> Self {
        self.stubs.insert(name.to_string(), value);
        self
    }
}

/// Adapts a closure into a [`TargetCallable`].
pub struct FnCallable {
    name: String,
    param_names: Vec<String>,
    body: Arc<dyn Fn(Vec<Value>) -> Result<Value, String> + Send + Sync>,
}

impl FnCallable {
    pub fn new<F>(name: &str, param_names: &[&str], body: F) -> Arc<dyn TargetCallable>
    where
        F: Fn(Vec<Value>) -> Result<Value, String> + Send + Sync + 'static,
    {
        Arc::new(Self {
            name: name.to_string(),
            param_names: param_names.iter().map(|p| p.to_string()).collect(),
            body: Arc::new(body),
        })
    }
}

impl TargetCallable for FnCallable {
    fn name(&self) -> &str {
        &self.name
    }

    fn param_names(&self) -> &[String] {
        &self.param_names
    }

    fn invoke(&self, args: Vec<Value>) -> Result<Value, String> {
        (self.body)(args)
    }
}

/// A target module assembled from a fixed set of callables.
pub struct StaticModule {
    path: PathBuf,
    callables: Vec<Arc<dyn TargetCallable>>,
}

impl StaticModule {
    pub fn new(path: PathBuf, callables: Vec<Arc<dyn TargetCallable>>) -> Self {
        Self { path, callables }
    }
}

impl TargetModule for StaticModule {
    fn path(&self) -> &Path {
        &self.path
    }

    fn callables(&self) -> &[Arc<dyn TargetCallable>] {
        &self.callables
    }
}

/// Matches profiling-session script URLs against the fuzz target, tolerating
/// file-URL vs. filesystem-path vs. relative-name variance. Preference order:
/// exact resolved-path equality, basename suffix, substring containment.
#[derive(Debug, Clone)]
pub struct TargetMatcher {
    resolved: String,
    basename: String,
}

impl TargetMatcher {
    pub fn new(target_path: &Path) -> Self {
        let resolved = target_path.to_string_lossy().to_string();
        let basename = target_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| resolved.clone());
        Self { resolved, basename }
    }

    pub fn matches(&self, url: &str) -> bool {
        let stripped = url.strip_prefix("file://").unwrap_or(url);
        if stripped == self.resolved {
            return true;
        }
        if stripped.ends_with(&self.basename) {
            return true;
        }
        url.contains(&self.resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn fn_callable_exposes_declared_parameters() {
        let callable = FnCallable::new("concat", &["left", "right"], |args| {
            let joined = args
                .iter()
                .map(|v| v.as_str().unwrap_or_default().to_string())
                .collect::<Vec<_>>()
                .join("");
            Ok(Value::String(joined))
        });
        assert_eq!(callable.name(), "concat");
        assert_eq!(callable.param_names(), &["left".to_string(), "right".to_string()]);
        assert_eq!(
            callable.invoke(vec![json!("a"), json!("b")]).unwrap(),
            json!("ab")
        );
    }

    #[test]
    fn static_module_lists_its_callables() {
        let module = StaticModule::new(
            PathBuf::from("/tmp/demo_target.js"),
            vec![
                FnCallable::new("first", &[], |_| Ok(Value::Null)),
                FnCallable::new("second", &["x"], |_| Ok(Value::Null)),
            ],
        );
        assert_eq!(module.path(), Path::new("/tmp/demo_target.js"));
        let names: Vec<&str> = module.callables().iter().map(|c| c.name()).collect();
        assert_eq!(names, vec!["first", "second"]);
    }

    #[test]
    fn matcher_tolerates_url_and_path_variants() {
        let matcher = TargetMatcher::new(Path::new("/srv/targets/demo_target.js"));
        assert!(matcher.matches("/srv/targets/demo_target.js"), "exact path");
        assert!(matcher.matches("file:///srv/targets/demo_target.js"), "file URL");
        assert!(matcher.matches("./demo_target.js"), "basename suffix");
        assert!(
            matcher.matches("wrapped:/srv/targets/demo_target.js?x=1"),
            "substring containment"
        );
        assert!(!matcher.matches("/srv/targets/other.js"));
        assert!(!matcher.matches("node:internal/modules"));
    }

    #[test]
    fn context_carries_explicit_stubs() {
        let ctx = TargetContext::new(PathBuf::from("./corpus"))
            .with_stub("db", json!({"rows": []}));
        assert_eq!(ctx.stubs.get("db"), Some(&json!({"rows": []})));
    }
}
