//! Built-in catalog of editor operations: parameter schemas and the timeout
//! class each operation runs under.

use crate::validation::{
    CrossFieldRule, FieldSpec, OperationSchema, SchemaError, SchemaRegistry, ValueKind,
};

const IDENTIFIER_PATTERN: &str = r"^[a-zA-Z_][a-zA-Z0-9_]*$";
const NAMESPACE_PATTERN: &str = r"^[a-zA-Z_][a-zA-Z0-9_.]*$";
const GLOB_PATTERN: &str = r"^[*?a-zA-Z0-9_.\-/\\]+$";
const MENU_PATH_PATTERN: &str = r"^[a-zA-Z0-9_\-/\s]+$";

/// Operation name -> timeout class name.
pub const OPERATION_CLASSES: &[(&str, &str)] = &[
    ("manage_script", "script_operation"),
    ("manage_scene", "scene_operation"),
    ("manage_gameobject", "gameobject_operation"),
    ("manage_asset", "asset_operation"),
    ("manage_editor", "editor_operation"),
    ("read_console", "console_operation"),
    ("execute_menu_item", "menu_operation"),
    ("manage_shader", "shader_operation"),
];

// ---------------------------------------------------------------------------
// Shared field shapes
// ---------------------------------------------------------------------------

fn action(choices: &[&str]) -> FieldSpec {
    FieldSpec::new("action")
        .required()
        .kind(ValueKind::String)
        .one_of(choices.iter().copied())
}

fn identifier(name: &str, required: bool) -> Result<FieldSpec, SchemaError> {
    let spec = FieldSpec::new(name);
    let spec = if required { spec.required() } else { spec };
    spec.kind(ValueKind::String).length(1, 255).pattern(IDENTIFIER_PATTERN)
}

fn path(name: &str, required: bool) -> FieldSpec {
    let spec = FieldSpec::new(name);
    let spec = if required { spec.required() } else { spec };
    spec.kind(ValueKind::String).path()
}

fn bounded_string(name: &str, max: usize) -> FieldSpec {
    FieldSpec::new(name).kind(ValueKind::String).length(1, max)
}

fn vector3(name: &str) -> FieldSpec {
    FieldSpec::new(name).kind(ValueKind::Array).vector(3)
}

// ---------------------------------------------------------------------------
// Per-operation schemas
// ---------------------------------------------------------------------------

fn manage_script() -> Result<OperationSchema, SchemaError> {
    Ok(OperationSchema::new("manage_script")
        .field(action(&["create", "read", "update", "delete"]))
        .field(identifier("name", true)?)
        .field(path("path", true))
        .field(FieldSpec::new("script_type").kind(ValueKind::String).one_of([
            "MonoBehaviour",
            "ScriptableObject",
            "Editor",
            "Custom",
        ]))
        .field(
            FieldSpec::new("namespace")
                .kind(ValueKind::String)
                .pattern(NAMESPACE_PATTERN)?,
        ))
}

fn manage_scene() -> Result<OperationSchema, SchemaError> {
    Ok(OperationSchema::new("manage_scene")
        .field(action(&[
            "load",
            "save",
            "create",
            "get_hierarchy",
            "get_active",
            "set_active",
        ]))
        .field(identifier("name", true)?)
        .field(path("path", true))
        .field(
            FieldSpec::new("build_index")
                .kind(ValueKind::Integer)
                .range(0.0, 1000.0),
        ))
}

fn manage_gameobject() -> Result<OperationSchema, SchemaError> {
    Ok(OperationSchema::new("manage_gameobject")
        .field(action(&[
            "create",
            "modify",
            "delete",
            "find",
            "add_component",
            "remove_component",
            "set_component_property",
            "get_components",
        ]))
        .field(bounded_string("target", 255))
        .field(
            FieldSpec::new("search_method")
                .kind(ValueKind::String)
                .one_of(["by_name", "by_id", "by_path", "by_tag"]),
        )
        .field(identifier("name", false)?)
        .field(bounded_string("tag", 50))
        .field(vector3("position"))
        .field(vector3("rotation"))
        .field(vector3("scale"))
        .cross(CrossFieldRule::required_when(
            "target",
            "action",
            [
                "modify",
                "delete",
                "add_component",
                "remove_component",
                "set_component_property",
                "get_components",
            ],
        )))
}

fn manage_asset() -> Result<OperationSchema, SchemaError> {
    Ok(OperationSchema::new("manage_asset")
        .field(action(&[
            "import",
            "create",
            "modify",
            "delete",
            "duplicate",
            "move",
            "rename",
            "search",
            "get_info",
            "create_folder",
            "get_components",
        ]))
        .field(path("path", true))
        .field(FieldSpec::new("asset_type").kind(ValueKind::String).one_of([
            "Material", "Texture", "Prefab", "Script", "Shader", "Folder",
        ]))
        .field(path("destination", false))
        .field(
            FieldSpec::new("search_pattern")
                .kind(ValueKind::String)
                .pattern(GLOB_PATTERN)?,
        )
        .cross(CrossFieldRule::required_when(
            "destination",
            "action",
            ["duplicate", "move"],
        )))
}

fn manage_editor() -> OperationSchema {
    OperationSchema::new("manage_editor")
        .field(action(&[
            "play",
            "pause",
            "stop",
            "get_state",
            "get_windows",
            "get_active_tool",
            "get_selection",
            "set_active_tool",
            "add_tag",
            "remove_tag",
            "get_tags",
            "add_layer",
            "remove_layer",
            "get_layers",
        ]))
        .field(bounded_string("tool_name", 100))
        .field(bounded_string("tag_name", 50))
        .field(bounded_string("layer_name", 50))
        .cross(CrossFieldRule::required_when(
            "tool_name",
            "action",
            ["set_active_tool"],
        ))
        .cross(CrossFieldRule::required_when(
            "tag_name",
            "action",
            ["add_tag", "remove_tag"],
        ))
        .cross(CrossFieldRule::required_when(
            "layer_name",
            "action",
            ["add_layer", "remove_layer"],
        ))
}

fn read_console() -> OperationSchema {
    OperationSchema::new("read_console")
        .field(action(&["get", "clear"]))
        .field(
            FieldSpec::new("types")
                .kind(ValueKind::Array)
                .each_one_of(["error", "warning", "log", "all"]),
        )
        .field(
            FieldSpec::new("count")
                .kind(ValueKind::Integer)
                .range(1.0, 10_000.0),
        )
        .field(
            FieldSpec::new("format")
                .kind(ValueKind::String)
                .one_of(["plain", "detailed", "json"]),
        )
}

fn execute_menu_item() -> Result<OperationSchema, SchemaError> {
    Ok(OperationSchema::new("execute_menu_item")
        .field(
            FieldSpec::new("menu_path")
                .required()
                .kind(ValueKind::String)
                .length(1, 500)
                .pattern(MENU_PATH_PATTERN)?,
        )
        .field(action(&["execute", "get_available_menus"])))
}

fn manage_shader() -> Result<OperationSchema, SchemaError> {
    Ok(OperationSchema::new("manage_shader")
        .field(action(&["create", "read", "update", "delete"]))
        .field(identifier("name", true)?)
        .field(path("path", true)))
}

/// Builds a strict registry holding every catalog operation.
///
/// # Errors
///
/// Returns `SchemaError` if a built-in pattern fails to compile.
pub fn default_registry() -> Result<SchemaRegistry, SchemaError> {
    let mut registry = SchemaRegistry::new();
    for schema in [
        manage_script()?,
        manage_scene()?,
        manage_gameobject()?,
        manage_asset()?,
        manage_editor(),
        read_console(),
        execute_menu_item()?,
        manage_shader()?,
    ] {
        registry.register(schema);
    }
    Ok(registry)
}
