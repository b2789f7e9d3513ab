//! The shipped demo context must stay a valid reference recipe.

use layerkit::launch::EntryPoint;
use layerkit::{Manifest, Recipe};
use std::path::Path;

fn demo_dir() -> &'static Path {
    Path::new(concat!(env!("CARGO_MANIFEST_DIR"), "/../demos/refactor-api"))
}

#[test]
fn test_demo_recipe_is_reference_recipe() {
    let recipe = Recipe::from_file(&demo_dir().join("Dockerfile")).unwrap();
    assert_eq!(recipe, Recipe::python_service());
}

#[test]
fn test_demo_manifest_is_fully_pinned() {
    let manifest = Manifest::from_file(&demo_dir().join("requirements.txt")).unwrap();
    assert_eq!(manifest.requirements.len(), 5);
    assert_eq!(manifest.unpinned().count(), 0);
}

#[test]
fn test_demo_entry_point_resolves() {
    let entry = EntryPoint::parse(&Recipe::python_service().command[1]).unwrap();
    let module = entry.resolve(demo_dir()).unwrap();
    let source = std::fs::read_to_string(module).unwrap();
    assert!(source.contains("@app.get(\"/ping\")"));
}
