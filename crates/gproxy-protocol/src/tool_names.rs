//! Canonical tool-name mapping table (spec §4.7 / GLOSSARY). The corrector
//! rewrites every tool call emitted by an upstream still speaking the legacy
//! agent-tool vocabulary into the canonical name the downstream client
//! expects, case- and style-insensitively (`work_dir`/`workDir` both match).

/// Returns the canonical name for `name`, or `None` if `name` is already
/// canonical or unrecognized.
pub fn canonical_tool_name(name: &str) -> Option<&'static str> {
    match name {
        "apply_patch" | "applyPatch" => Some("edit"),
        "update_plan" | "updatePlan" => Some("todowrite"),
        "read_plan" | "readPlan" => Some("todoread"),
        "search_files" | "searchFiles" => Some("grep"),
        "list_files" | "listFiles" => Some("glob"),
        "read_file" | "readFile" => Some("read"),
        "write_file" | "writeFile" => Some("write"),
        "execute_bash" | "executeBash" | "exec_bash" | "execBash" => Some("bash"),
        "fetch" | "web_fetch" | "webFetch" => Some("webfetch"),
        _ => None,
    }
}

/// `bash` argument field renamed on rewrite: `work_dir` -> `workdir`.
pub const BASH_WORKDIR_ALIASES: &[&str] = &["work_dir"];
pub const BASH_WORKDIR_CANONICAL: &str = "workdir";

/// `edit` argument fields renamed on rewrite, in priority order (first
/// non-conflicting source wins).
pub const EDIT_FIELD_RENAMES: &[(&str, &[&str])] = &[
    ("filePath", &["file_path", "path", "file"]),
    ("oldString", &["old_string"]),
    ("newString", &["new_string"]),
    ("replaceAll", &["replace_all"]),
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_both_snake_and_camel_variants() {
        assert_eq!(canonical_tool_name("apply_patch"), Some("edit"));
        assert_eq!(canonical_tool_name("applyPatch"), Some("edit"));
        assert_eq!(canonical_tool_name("execute_bash"), Some("bash"));
        assert_eq!(canonical_tool_name("execBash"), Some("bash"));
    }

    #[test]
    fn unknown_or_already_canonical_names_pass_through() {
        assert_eq!(canonical_tool_name("edit"), None);
        assert_eq!(canonical_tool_name("some_custom_tool"), None);
    }
}
