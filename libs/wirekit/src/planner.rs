//! Load-order planning: library dependency sort and per-module wire order.

use std::collections::HashSet;

use crate::errors::BootstrapError;
use crate::registry::{Library, ServiceFactory};

/// Order an application's libraries so every library comes after its
/// declared dependencies.
///
/// Iteratively places any library whose dependencies are all placed,
/// preserving attachment order among the ready ones. Dependency references
/// resolve against the application's own library list; a reference that is
/// not the identical definition logs a warning and the application's copy
/// wins.
///
/// # Errors
/// - [`BootstrapError::DuplicateLibrary`] for duplicate sibling names.
/// - [`BootstrapError::MissingDependency`] when a dependency name is not
///   attached to the application.
/// - [`BootstrapError::BadSort`] when no progress can be made (a dependency
///   cycle), naming the libraries already placed.
pub(crate) fn order_libraries(libraries: &[Library]) -> Result<Vec<Library>, BootstrapError> {
    for (index, library) in libraries.iter().enumerate() {
        if libraries[..index].iter().any(|l| l.name() == library.name()) {
            return Err(BootstrapError::DuplicateLibrary {
                library: library.name().to_owned(),
            });
        }
    }

    for library in libraries {
        for dep in library.depends() {
            match libraries.iter().find(|l| l.name() == dep.name()) {
                None => {
                    return Err(BootstrapError::MissingDependency {
                        library: library.name().to_owned(),
                        dependency: dep.name().to_owned(),
                    });
                }
                Some(attached) => {
                    if !attached.ptr_eq(dep) {
                        tracing::warn!(
                            library = library.name(),
                            dependency = dep.name(),
                            "dependency is a different copy of '{}'; using the application's",
                            dep.name()
                        );
                    }
                }
            }
        }
    }

    let mut placed: Vec<Library> = Vec::with_capacity(libraries.len());
    let mut placed_names: HashSet<&str> = HashSet::new();

    while placed.len() < libraries.len() {
        let mut progressed = false;
        for library in libraries {
            if placed_names.contains(library.name()) {
                continue;
            }
            let ready = library
                .depends()
                .iter()
                .all(|dep| placed_names.contains(dep.name()));
            if ready {
                placed_names.insert(library.name());
                placed.push(library.clone());
                progressed = true;
            }
        }
        if !progressed {
            return Err(BootstrapError::BadSort {
                placed: placed.iter().map(|l| l.name().to_owned()).collect(),
            });
        }
    }
    Ok(placed)
}

/// Construction order of a module's services: the priority list first, the
/// remaining services in declaration order.
pub(crate) fn wire_order<'a>(
    priority_init: &'a [String],
    services: &'a [(String, ServiceFactory)],
) -> Vec<&'a str> {
    let mut order: Vec<&str> = priority_init.iter().map(String::as_str).collect();
    for (name, _) in services {
        if !priority_init.iter().any(|p| p == name) {
            order.push(name);
        }
    }
    order
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::registry::erase_factory;

    fn lib(name: &str) -> Library {
        Library::builder(name).build().unwrap()
    }

    fn names(order: &[Library]) -> Vec<&str> {
        order.iter().map(Library::name).collect()
    }

    #[test]
    fn dependencies_come_first() {
        let core = lib("core");
        let net = Library::builder("net").depends_on(&core).build().unwrap();
        let app_lib = Library::builder("app-lib")
            .depends_on(&net)
            .depends_on(&core)
            .build()
            .unwrap();

        // Attached out of order on purpose.
        let order = order_libraries(&[app_lib, net, core]).unwrap();
        assert_eq!(names(&order), vec!["core", "net", "app-lib"]);
    }

    #[test]
    fn missing_dependency_is_reported() {
        let core = lib("core");
        let net = Library::builder("net").depends_on(&core).build().unwrap();

        let err = order_libraries(&[net]).unwrap_err();
        match err {
            BootstrapError::MissingDependency { library, dependency } => {
                assert_eq!(library, "net");
                assert_eq!(dependency, "core");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn cycle_reports_placed_libraries() {
        // a <-> b cannot sort; standalone c places first.
        let a_seed = lib("a");
        let b = Library::builder("b").depends_on(&a_seed).build().unwrap();
        let a = Library::builder("a").depends_on(&b).build().unwrap();
        let c = lib("c");

        let err = order_libraries(&[a, b, c]).unwrap_err();
        match err {
            BootstrapError::BadSort { placed } => assert_eq!(placed, vec!["c".to_owned()]),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn duplicate_sibling_names_are_rejected() {
        let err = order_libraries(&[lib("dup"), lib("dup")]).unwrap_err();
        assert!(matches!(err, BootstrapError::DuplicateLibrary { .. }));
    }

    #[test]
    fn different_copy_of_dependency_still_sorts() {
        // The app attaches its own "core"; "net" depends on another copy.
        let foreign_core = lib("core");
        let net = Library::builder("net").depends_on(&foreign_core).build().unwrap();
        let own_core = lib("core");

        let order = order_libraries(&[net, own_core.clone()]).unwrap();
        assert_eq!(names(&order), vec!["core", "net"]);
        assert!(order[0].ptr_eq(&own_core));
    }

    #[test]
    fn wire_order_puts_priority_first() {
        let factory = erase_factory(|_p| async { Ok(None) });
        let services = vec![
            ("one".to_owned(), factory.clone()),
            ("two".to_owned(), factory.clone()),
            ("three".to_owned(), factory),
        ];
        let priority = vec!["two".to_owned()];
        assert_eq!(wire_order(&priority, &services), vec!["two", "one", "three"]);
    }
}
