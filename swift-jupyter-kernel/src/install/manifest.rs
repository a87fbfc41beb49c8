//! Synthetic package manifest
//!
//! `%install` works by building a throwaway package that depends on every
//! requested package and links every requested product into one dynamic
//! library. The manifest schema is 5.5, new enough for branch-based
//! dependency specifications.

/// Name of the synthesized package and its dynamic library product
pub const PACKAGE_NAME: &str = "jupyterInstalledPackages";

/// File name of the stub source the target compiles
pub const STUB_SOURCE_NAME: &str = "jupyterInstalledPackages.swift";

/// Contents of the stub source file
pub const STUB_SOURCE: &str = "// Links the products requested with %install.\n";

/// Render the manifest for the given dependency specs and linked products
pub fn render_manifest(specs: &[String], products: &[String]) -> String {
    let dependencies = specs
        .iter()
        .map(|spec| format!("        {spec},"))
        .collect::<Vec<_>>()
        .join("\n");
    let linked = products
        .iter()
        .map(|product| format!("\"{product}\""))
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        r#"// swift-tools-version:5.5
import PackageDescription

let package = Package(
    name: "{PACKAGE_NAME}",
    products: [
        .library(
            name: "{PACKAGE_NAME}",
            type: .dynamic,
            targets: ["{PACKAGE_NAME}"]),
    ],
    dependencies: [
{dependencies}
    ],
    targets: [
        .target(
            name: "{PACKAGE_NAME}",
            dependencies: [{linked}],
            path: ".",
            sources: ["{STUB_SOURCE_NAME}"]),
    ]
)
"#
    )
}
