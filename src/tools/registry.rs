//! Tool registry for managing available tools.

use std::collections::HashMap;
use std::sync::Arc;

use crate::agent::Mode;
use crate::error::RegistryError;
use crate::sandbox::ExecutionSandbox;
use crate::tools::builtin::{
    ApplyPatchTool, DeleteFileTool, ListDirTool, ReadFileTool, ShellTool, WriteFileTool,
};
use crate::tools::tool::{Tool, ToolSpec, validate_tool_schema};

struct RegisteredTool {
    tool: Arc<dyn Tool>,
    spec: ToolSpec,
    validator: jsonschema::Validator,
}

/// Registry of available tools.
///
/// Tools are registered once at startup and never change afterwards.
/// Registration order is preserved and is the order advertised to the model.
#[derive(Default)]
pub struct ToolRegistry {
    tools: Vec<RegisteredTool>,
    index: HashMap<String, usize>,
}

impl ToolRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool.
    ///
    /// Fails if the name is taken or the parameter schema is unusable. The
    /// schema is compiled here so argument validation at dispatch time can
    /// never fail on the schema itself.
    pub fn register(&mut self, tool: Arc<dyn Tool>) -> Result<(), RegistryError> {
        let spec = tool.spec();
        if self.index.contains_key(&spec.name) {
            return Err(RegistryError::AlreadyRegistered { name: spec.name });
        }

        let errors = validate_tool_schema(&spec.parameters, &spec.name);
        if !errors.is_empty() {
            return Err(RegistryError::InvalidSchema {
                name: spec.name,
                errors,
            });
        }

        let validator = jsonschema::validator_for(&spec.parameters).map_err(|e| {
            RegistryError::InvalidSchema {
                name: spec.name.clone(),
                errors: vec![e.to_string()],
            }
        })?;

        tracing::debug!(tool = %spec.name, mutating = spec.mutating, "Registered tool");
        self.index.insert(spec.name.clone(), self.tools.len());
        self.tools.push(RegisteredTool {
            tool,
            spec,
            validator,
        });
        Ok(())
    }

    /// Register the file and shell tools, rooted at the sandbox's workspace.
    ///
    /// Read-only tools come first so plan mode sees a stable prefix.
    pub fn register_builtin_tools(
        &mut self,
        sandbox: Arc<ExecutionSandbox>,
    ) -> Result<(), RegistryError> {
        let root = sandbox.root().to_path_buf();
        self.register(Arc::new(ReadFileTool::new(&root)))?;
        self.register(Arc::new(ListDirTool::new(&root)))?;
        self.register(Arc::new(WriteFileTool::new(&root)))?;
        self.register(Arc::new(ApplyPatchTool::new(&root)))?;
        self.register(Arc::new(DeleteFileTool::new(&root)))?;
        self.register(Arc::new(ShellTool::new(sandbox)))?;
        Ok(())
    }

    /// Get a tool by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.entry(name).map(|t| Arc::clone(&t.tool))
    }

    /// Get the registered spec for a tool.
    pub fn spec(&self, name: &str) -> Option<&ToolSpec> {
        self.entry(name).map(|t| &t.spec)
    }

    /// Specs advertised to the model in `mode`, in registration order.
    ///
    /// Plan mode only sees non-mutating tools.
    pub fn schemas_for(&self, mode: Mode) -> Vec<ToolSpec> {
        self.tools
            .iter()
            .filter(|t| mode.allows_mutation() || !t.spec.mutating)
            .map(|t| t.spec.clone())
            .collect()
    }

    /// List all tool names in registration order.
    pub fn list(&self) -> Vec<String> {
        self.tools.iter().map(|t| t.spec.name.clone()).collect()
    }

    /// Get the number of registered tools.
    pub fn count(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Validate call arguments against the tool's parameter schema.
    ///
    /// Returns every violation found, or `None` for an unknown tool.
    pub fn validate_arguments(
        &self,
        name: &str,
        arguments: &serde_json::Value,
    ) -> Option<Result<(), Vec<String>>> {
        let entry = self.entry(name)?;
        let errors: Vec<String> = entry
            .validator
            .iter_errors(arguments)
            .map(|err| err.to_string())
            .collect();
        Some(if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        })
    }

    fn entry(&self, name: &str) -> Option<&RegisteredTool> {
        self.index.get(name).and_then(|&i| self.tools.get(i))
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.list())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::SpyTool;

    #[test]
    fn test_register_and_lookup() {
        let mut registry = ToolRegistry::new();
        registry.register(SpyTool::read_only("inspect").into_arc()).unwrap();

        assert!(registry.get("inspect").is_some());
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn test_duplicate_name_conflicts() {
        let mut registry = ToolRegistry::new();
        registry.register(SpyTool::read_only("inspect").into_arc()).unwrap();
        let err = registry
            .register(SpyTool::mutating("inspect").into_arc())
            .unwrap_err();
        assert!(matches!(err, RegistryError::AlreadyRegistered { name } if name == "inspect"));
        // The original registration is untouched.
        assert!(!registry.spec("inspect").unwrap().mutating);
    }

    #[test]
    fn test_invalid_schema_rejected() {
        let mut registry = ToolRegistry::new();
        let tool = SpyTool::read_only("broken").with_schema(serde_json::json!({
            "type": "object",
            "properties": {},
            "required": ["ghost"]
        }));
        let err = registry.register(tool.into_arc()).unwrap_err();
        assert!(matches!(err, RegistryError::InvalidSchema { .. }));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_schemas_for_mode_filters_mutating_tools() {
        let mut registry = ToolRegistry::new();
        registry.register(SpyTool::read_only("read").into_arc()).unwrap();
        registry.register(SpyTool::mutating("write").into_arc()).unwrap();
        registry.register(SpyTool::read_only("list").into_arc()).unwrap();

        let plan: Vec<_> = registry
            .schemas_for(Mode::Plan)
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(plan, vec!["read", "list"]);

        let build: Vec<_> = registry
            .schemas_for(Mode::Build)
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(build, vec!["read", "write", "list"]);
    }

    #[test]
    fn test_builtin_tools_register_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = ExecutionSandbox::new(crate::sandbox::SandboxConfig::with_root(dir.path()))
            .unwrap();
        let mut registry = ToolRegistry::new();
        registry.register_builtin_tools(Arc::new(sandbox)).unwrap();

        assert_eq!(
            registry.list(),
            vec![
                "read_file",
                "list_directory",
                "write_file",
                "apply_patch",
                "delete_file",
                "run_command"
            ]
        );
        let plan: Vec<_> = registry
            .schemas_for(Mode::Plan)
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(plan, vec!["read_file", "list_directory"]);
    }

    #[test]
    fn test_validate_arguments() {
        let mut registry = ToolRegistry::new();
        registry.register(SpyTool::read_only("read").into_arc()).unwrap();

        assert_eq!(
            registry.validate_arguments("read", &serde_json::json!({"target": "a"})),
            Some(Ok(()))
        );
        let errors = registry
            .validate_arguments("read", &serde_json::json!({"target": 5}))
            .unwrap()
            .unwrap_err();
        assert!(!errors.is_empty());
        assert!(
            registry
                .validate_arguments("read", &serde_json::json!("not an object"))
                .unwrap()
                .is_err()
        );
        assert!(registry.validate_arguments("nope", &serde_json::json!({})).is_none());
    }
}
