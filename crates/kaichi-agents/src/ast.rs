//! Syntax-level handling of generated Python programs: fenced-block
//! extraction, function discovery, and identifier rewriting.

use kaichi_core::{KaichiError, KaichiResult};
use once_cell::sync::Lazy;
use regex::Regex;
use tree_sitter::{Node, Parser};

static CODE_FENCE: Lazy<Regex> = Lazy::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(r"(?s)```[a-zA-Z0-9_]*[ \t]*\n(.*?)```").unwrap()
});

/// A function definition found in a program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionDef {
    pub name: String,
    pub is_async: bool,
}

/// Pull the contents of every fenced code block out of an LLM answer.
pub fn extract_code_blocks(message: &str) -> Vec<String> {
    CODE_FENCE
        .captures_iter(message)
        .map(|caps| caps[1].trim_end().to_string())
        .collect()
}

/// Parse a Python program and list its function definitions in source
/// order. Fails when the program does not parse cleanly.
pub fn parse_functions(code: &str) -> KaichiResult<Vec<FunctionDef>> {
    let mut parser = Parser::new();
    parser
        .set_language(&tree_sitter_python::LANGUAGE.into())
        .map_err(|e| KaichiError::Parse(format!("Python grammar unavailable: {e}")))?;

    let tree = parser
        .parse(code, None)
        .ok_or_else(|| KaichiError::Parse("Failed to parse program".to_string()))?;

    if tree.root_node().has_error() {
        return Err(KaichiError::Parse(
            "Generated program has syntax errors".to_string(),
        ));
    }

    let mut functions = Vec::new();
    collect_functions(tree.root_node(), code, &mut functions);
    Ok(functions)
}

fn collect_functions(node: Node, source: &str, functions: &mut Vec<FunctionDef>) {
    if node.kind() == "function_definition" {
        if let Some(name) = node
            .child_by_field_name("name")
            .and_then(|n| source.get(n.byte_range()))
        {
            let mut cursor = node.walk();
            let is_async = node.children(&mut cursor).any(|c| c.kind() == "async");
            functions.push(FunctionDef {
                name: name.to_string(),
                is_async,
            });
        }
    }
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        collect_functions(child, source, functions);
    }
}

/// The entry point of a generated program: its last async function.
pub fn last_async_function(functions: &[FunctionDef]) -> Option<&FunctionDef> {
    functions.iter().rev().find(|f| f.is_async)
}

/// Rewrite every whole-word occurrence of an identifier.
pub fn rename_identifier(code: &str, old: &str, new: &str) -> KaichiResult<String> {
    let pattern = Regex::new(&format!(r"\b{}\b", regex::escape(old)))
        .map_err(|e| KaichiError::Parse(e.to_string()))?;
    Ok(pattern.replace_all(code, new).into_owned())
}
