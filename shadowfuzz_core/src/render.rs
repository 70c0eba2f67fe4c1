//! Turns an operation sequence into a runnable program of the language under test.
//!
//! Every program has the same construct-then-invoke shape:
//!
//! ```text
//! fun main() {
//!     let mut instance = Stack::new();
//!     instance.push(3);
//!     println(instance.pop());
//! }
//! ```

use crate::schema::Schema;
use crate::testcase::OperationCall;
use serde::Deserialize;
use std::fmt::Write;

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct RenderSettings {
    #[serde(default = "default_entry_open")]
    pub entry_open: String,
    #[serde(default = "default_entry_close")]
    pub entry_close: String,
    #[serde(default = "default_binding")]
    pub binding: String,
    /// Function wrapped around calls with a non-unit return, so results reach stdout.
    #[serde(default = "default_print_fn")]
    pub print_fn: String,
    #[serde(default = "default_indent")]
    pub indent: String,
}

fn default_entry_open() -> String {
    "fun main() {".to_string()
}
fn default_entry_close() -> String {
    "}".to_string()
}
fn default_binding() -> String {
    "instance".to_string()
}
fn default_print_fn() -> String {
    "println".to_string()
}
fn default_indent() -> String {
    "    ".to_string()
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            entry_open: default_entry_open(),
            entry_close: default_entry_close(),
            binding: default_binding(),
            print_fn: default_print_fn(),
            indent: default_indent(),
        }
    }
}

impl RenderSettings {
    /// One line per call. The output always ends with a newline.
    pub fn render(&self, type_name: &str, constructor: &OperationCall, calls: &[OperationCall]) -> String {
        let mut out = String::new();
        out.push_str(&self.entry_open);
        out.push('\n');
        // Writing into a String is infallible.
        let _ = writeln!(
            out,
            "{}let mut {} = {}::{};",
            self.indent,
            self.binding,
            type_name,
            constructor.signature_line()
        );
        for call in calls {
            let invocation = format!("{}.{}", self.binding, call.signature_line());
            if call.returns.is_unit() {
                let _ = writeln!(out, "{}{};", self.indent, invocation);
            } else {
                let _ = writeln!(out, "{}{}({});", self.indent, self.print_fn, invocation);
            }
        }
        out.push_str(&self.entry_close);
        out.push('\n');
        out
    }

    pub fn render_for(&self, schema: &Schema, constructor: &OperationCall, calls: &[OperationCall]) -> String {
        self.render(&schema.type_name, constructor, calls)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::TypeTag;
    use crate::testcase::Value;

    fn call(name: &str, args: Vec<Value>, returns: TypeTag) -> OperationCall {
        OperationCall {
            operation: name.to_string(),
            arguments: args,
            returns,
            timeout_ms: 10,
        }
    }

    #[test]
    fn renders_construct_then_invoke_program() {
        let settings = RenderSettings::default();
        let ctor = call("new", vec![], TypeTag::Named("Stack".into()));
        let calls = vec![
            call("push", vec![Value::Int(3)], TypeTag::Unit),
            call("pop", vec![], TypeTag::Int),
        ];
        let source = settings.render("Stack", &ctor, &calls);
        assert_eq!(
            source,
            "fun main() {\n    let mut instance = Stack::new();\n    instance.push(3);\n    println(instance.pop());\n}\n"
        );
    }

    #[test]
    fn custom_template_is_applied() {
        let settings = RenderSettings {
            entry_open: "main = do".into(),
            entry_close: "end".into(),
            binding: "s".into(),
            print_fn: "show".into(),
            indent: "  ".into(),
        };
        let ctor = call("with_capacity", vec![Value::Int(4)], TypeTag::Named("Buf".into()));
        let source = settings.render("Buf", &ctor, &[call("len", vec![], TypeTag::Int)]);
        assert_eq!(
            source,
            "main = do\n  let mut s = Buf::with_capacity(4);\n  show(s.len());\nend\n"
        );
    }
}
