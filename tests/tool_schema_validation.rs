//! Validates that all built-in tool schemas pass the registration check and
//! that the advertised tool set per mode stays what the prompts promise.
//!
//! This catches the class of bugs where `required` keys aren't in
//! `properties`, array properties lack `items`, or a mutating tool leaks
//! into plan mode.

use std::sync::Arc;

use opspilot::agent::Mode;
use opspilot::sandbox::{ExecutionSandbox, SandboxConfig};
use opspilot::tools::builtin::{
    ApplyPatchTool, DeleteFileTool, ListDirTool, ReadFileTool, ShellTool, WriteFileTool,
};
use opspilot::tools::{Tool, ToolRegistry, validate_tool_schema};

fn builtin_tools(root: &std::path::Path) -> Vec<Arc<dyn Tool>> {
    let sandbox = Arc::new(ExecutionSandbox::new(SandboxConfig::with_root(root)).unwrap());
    vec![
        Arc::new(ReadFileTool::new(root)),
        Arc::new(ListDirTool::new(root)),
        Arc::new(WriteFileTool::new(root)),
        Arc::new(ApplyPatchTool::new(root)),
        Arc::new(DeleteFileTool::new(root)),
        Arc::new(ShellTool::new(sandbox)),
    ]
}

#[test]
fn all_builtin_tool_schemas_are_valid() {
    let dir = tempfile::tempdir().unwrap();

    let mut all_errors = Vec::new();
    for tool in builtin_tools(dir.path()) {
        let schema = tool.parameters_schema();
        let errors = validate_tool_schema(&schema, tool.name());
        if !errors.is_empty() {
            all_errors.push(format!(
                "Tool '{}' has schema errors:\n  {}",
                tool.name(),
                errors.join("\n  ")
            ));
        }
        assert!(
            !tool.description().is_empty(),
            "tool '{}' needs a description",
            tool.name()
        );
    }

    assert!(
        all_errors.is_empty(),
        "Tool schema validation failures:\n{}",
        all_errors.join("\n\n")
    );
}

/// Verify the exact set of tools registered by `register_builtin_tools()`.
/// This guards against a new tool being added without coverage here.
#[test]
fn builtin_registration_covers_expected_tools() {
    let dir = tempfile::tempdir().unwrap();
    let sandbox = Arc::new(ExecutionSandbox::new(SandboxConfig::with_root(dir.path())).unwrap());
    let mut registry = ToolRegistry::new();
    registry.register_builtin_tools(sandbox).unwrap();

    let mut names = registry.list();
    names.sort();
    assert_eq!(
        names,
        &[
            "apply_patch",
            "delete_file",
            "list_directory",
            "read_file",
            "run_command",
            "write_file",
        ],
        "Built-in tool set changed. Update this test."
    );
}

#[test]
fn only_read_only_tools_are_advertised_in_plan_mode() {
    let dir = tempfile::tempdir().unwrap();
    let sandbox = Arc::new(ExecutionSandbox::new(SandboxConfig::with_root(dir.path())).unwrap());
    let mut registry = ToolRegistry::new();
    registry.register_builtin_tools(sandbox).unwrap();

    for spec in registry.schemas_for(Mode::Plan) {
        assert!(!spec.mutating, "{} is mutating but visible in plan mode", spec.name);
    }
    let build = registry.schemas_for(Mode::Build);
    assert_eq!(build.len(), registry.count());
    for name in ["write_file", "apply_patch", "delete_file", "run_command"] {
        assert!(
            build.iter().any(|s| s.name == name && s.mutating),
            "{name} should be a mutating build-mode tool"
        );
    }
}

#[test]
fn shell_env_schema_is_an_object_of_strings() {
    let dir = tempfile::tempdir().unwrap();
    let sandbox = Arc::new(ExecutionSandbox::new(SandboxConfig::with_root(dir.path())).unwrap());
    let schema = ShellTool::new(sandbox).parameters_schema();

    let env = schema
        .get("properties")
        .and_then(|p| p.get("env"))
        .expect("run_command should have an 'env' property");
    assert_eq!(env.get("type").and_then(|t| t.as_str()), Some("object"));
    assert_eq!(
        env.pointer("/additionalProperties/type")
            .and_then(|t| t.as_str()),
        Some("string")
    );
}
