//! Configuration loading tests.

use weft::config::Config;

#[test]
fn load_from_toml_overrides_defaults() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let path = tmp.path().join("weft.toml");
    std::fs::write(
        &path,
        r#"
[optimization]
constant_folding = false
max_fixpoint_iterations = 3

[scheduler]
max_content_cycles = 7

[logging]
level = "weft=debug"
"#,
    )
    .expect("write config");

    let config = Config::load_from(&path).expect("load");
    assert!(!config.optimization.constant_folding);
    // Untouched fields keep their defaults.
    assert!(config.optimization.qualifier_simplification);
    assert_eq!(config.optimization.max_fixpoint_iterations, 3);
    assert_eq!(config.scheduler.max_content_cycles, 7);
    assert_eq!(config.scheduler.max_export_reentry, 10);
    assert_eq!(config.logging.level, "weft=debug");
    assert!(!config.logging.json);
}

#[test]
fn missing_file_falls_back_to_defaults() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let path = tmp.path().join("does-not-exist.toml");
    let config = Config::load_from(&path).expect("load");
    assert!(config.optimization.constant_folding);
    assert_eq!(config.scheduler.max_content_cycles, 100);
}

#[test]
fn disabled_folding_keeps_applications_unfolded() {
    use std::cell::RefCell;
    use std::rc::Rc;
    use weft::compiler::Compiler;
    use weft::fnode::{BuiltinFunction, DefunId, FunctionNodeKind};
    use weft::path::PathStore;
    use weft::template::TemplateId;

    let mut config = Config::default();
    config.optimization.constant_folding = false;
    let paths = Rc::new(RefCell::new(PathStore::new()));
    let mut c = Compiler::new(paths, config.optimization, 10);

    let two = c.exprs.number(2.0);
    let three = c.exprs.number(3.0);
    let plus = c.exprs.apply(BuiltinFunction::Plus, vec![two, three]);
    let node = c.build_simple_function_node(
        plus,
        None,
        TemplateId::GLOBAL,
        DefunId::NONE,
        false,
        &[],
        &[],
        Some(plus),
        TemplateId::GLOBAL,
    );
    assert!(matches!(
        c.pool.get(node).kind,
        FunctionNodeKind::Apply {
            function: BuiltinFunction::Plus,
            ..
        }
    ));
}
