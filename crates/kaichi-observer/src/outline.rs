use tracing::warn;
use tree_sitter::{Node, Parser};

/// Summarize the classes and functions of one Python source file as a
/// single line, e.g. `src/app.py: class App, def helper, async def run`.
/// Returns `None` when the file has no definitions or fails to parse.
pub(crate) fn outline_python(path: &str, source: &str) -> Option<String> {
    let mut parser = Parser::new();
    if let Err(e) = parser.set_language(&tree_sitter_python::LANGUAGE.into()) {
        warn!(error = %e, "Python grammar unavailable");
        return None;
    }
    let tree = parser.parse(source, None)?;

    let mut items = Vec::new();
    collect(tree.root_node(), source, &mut items);
    if items.is_empty() {
        return None;
    }
    Some(format!("{path}: {}", items.join(", ")))
}

fn collect(node: Node, source: &str, items: &mut Vec<String>) {
    match node.kind() {
        "class_definition" => {
            if let Some(name) = name_of(node, source) {
                items.push(format!("class {name}"));
            }
        }
        "function_definition" => {
            if let Some(name) = name_of(node, source) {
                if is_async(node) {
                    items.push(format!("async def {name}"));
                } else {
                    items.push(format!("def {name}"));
                }
            }
        }
        _ => {}
    }

    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        collect(child, source, items);
    }
}

fn name_of(node: Node, source: &str) -> Option<String> {
    let name = node.child_by_field_name("name")?;
    source.get(name.byte_range()).map(String::from)
}

fn is_async(node: Node) -> bool {
    let mut cursor = node.walk();
    let result = node.children(&mut cursor).any(|c| c.kind() == "async");
    result
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_outline_mixed_definitions() {
        let source = "class Store:\n    def get(self):\n        pass\n\nasync def main():\n    pass\n";
        let line = outline_python("store.py", source).unwrap();
        assert!(line.starts_with("store.py: "));
        assert!(line.contains("class Store"));
        assert!(line.contains("def get"));
        assert!(line.contains("async def main"));
    }

    #[test]
    fn test_outline_empty_file() {
        assert!(outline_python("empty.py", "x = 1\n").is_none());
    }
}
