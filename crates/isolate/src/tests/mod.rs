use std::fmt::Display;

mod action;
mod adversarial;
mod analyze;
mod args_validation;
mod r#async;
mod auth;
mod backend_state;
mod basic;
mod custom_errors;
mod environment_variables;
mod fetch;
mod globals;
mod id_encoding;
mod id_strings;
mod import;
mod internal;
mod js_builtins;
mod module_loader;
mod query;
mod scheduler;
mod schema;
mod shapes;
mod size_errors;
mod system_udfs;
mod user_error;
mod values;
mod vector_search;

pub fn assert_contains(error: &impl Display, expected: &str) {
    assert!(
        format!("{}", error).contains(expected),
        "\nExpected: {expected}\nActual: {error}"
    );
}
