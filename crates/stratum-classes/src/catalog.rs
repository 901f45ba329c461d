//! Catalog of the built-in classes.

use std::sync::Arc;

use stratum_core::{Class, ClassId, GeomError, MeshHandle};

use crate::label::LabelClass;
use crate::md::MdClass;
use crate::mirror::MirrorClass;
use crate::nop::NopClass;
use crate::slice::SliceClass;

/// Role of a class in a stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClassKind {
    /// Leaf storage with no consumers.
    Leaf,
    /// One consumer in, one provider out.
    Filter,
    /// Several consumers in, one provider out.
    Aggregate,
}

impl ClassKind {
    /// Returns a human-readable name for the kind.
    pub const fn name(&self) -> &'static str {
        match self {
            ClassKind::Leaf => "Leaf",
            ClassKind::Filter => "Filter",
            ClassKind::Aggregate => "Aggregate",
        }
    }
}

/// Describes a class in the catalog.
#[derive(Debug, Clone)]
pub struct ClassDescriptor {
    /// Class name as registered.
    pub name: &'static str,
    /// Brief description.
    pub description: &'static str,
    /// Role in a stack.
    pub kind: ClassKind,
    /// Verbs understood beyond the standard ones.
    pub verbs: &'static [&'static str],
    /// `configure` actions.
    pub actions: &'static [&'static str],
    /// True if the class claims providers through taste.
    pub tastes: bool,
}

type ClassFactory = fn() -> Arc<dyn Class>;

struct CatalogEntry {
    descriptor: ClassDescriptor,
    factory: ClassFactory,
}

/// Every built-in class with a factory for it.
pub struct ClassCatalog {
    entries: Vec<CatalogEntry>,
}

impl Default for ClassCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl ClassCatalog {
    /// A catalog holding all built-in classes.
    pub fn new() -> Self {
        let mut catalog = Self {
            entries: Vec::with_capacity(5),
        };
        catalog.register_builtin_classes();
        catalog
    }

    fn register_builtin_classes(&mut self) {
        self.register(
            ClassDescriptor {
                name: crate::md::CLASS_NAME,
                description: "Memory-backed disks",
                kind: ClassKind::Leaf,
                verbs: &[],
                actions: &["fail", "resize", "readonly"],
                tastes: false,
            },
            || Arc::new(MdClass),
        );

        self.register(
            ClassDescriptor {
                name: crate::nop::CLASS_NAME,
                description: "Transparent pass-through with request counters",
                kind: ClassKind::Filter,
                verbs: &[],
                actions: &["reset"],
                tastes: true,
            },
            || Arc::new(NopClass),
        );

        self.register(
            ClassDescriptor {
                name: crate::slice::CLASS_NAME,
                description: "Fixed windows onto a provider",
                kind: ClassKind::Filter,
                verbs: &[],
                actions: &[],
                tastes: false,
            },
            || Arc::new(SliceClass),
        );

        self.register(
            ClassDescriptor {
                name: crate::label::CLASS_NAME,
                description: "Name-based access through a label sector",
                kind: ClassKind::Filter,
                verbs: &["label", "clear"],
                actions: &[],
                tastes: true,
            },
            || Arc::new(LabelClass),
        );

        self.register(
            ClassDescriptor {
                name: crate::mirror::CLASS_NAME,
                description: "RAID-1 across any number of components",
                kind: ClassKind::Aggregate,
                verbs: &[],
                actions: &["insert", "remove"],
                tastes: false,
            },
            || Arc::new(MirrorClass),
        );
    }

    fn register(&mut self, descriptor: ClassDescriptor, factory: ClassFactory) {
        self.entries.push(CatalogEntry {
            descriptor,
            factory,
        });
    }

    /// All descriptors, in registration order.
    pub fn all(&self) -> impl Iterator<Item = &ClassDescriptor> {
        self.entries.iter().map(|e| &e.descriptor)
    }

    /// Descriptor lookup by class name (case-insensitive).
    pub fn get(&self, name: &str) -> Option<&ClassDescriptor> {
        self.entries
            .iter()
            .find(|e| e.descriptor.name.eq_ignore_ascii_case(name))
            .map(|e| &e.descriptor)
    }

    /// Instantiates the named class.
    pub fn create(&self, name: &str) -> Option<Arc<dyn Class>> {
        self.entries
            .iter()
            .find(|e| e.descriptor.name.eq_ignore_ascii_case(name))
            .map(|e| (e.factory)())
    }

    /// Registers every class in the catalog with `mesh`.
    pub fn register_all(&self, mesh: &MeshHandle) -> Result<Vec<ClassId>, GeomError> {
        self.entries
            .iter()
            .map(|e| mesh.register_class((e.factory)()))
            .collect()
    }

    /// Number of classes.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if the catalog is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stratum_core::Mesh;

    #[test]
    fn catalog_holds_builtins() {
        let catalog = ClassCatalog::new();
        assert_eq!(catalog.len(), 5);
        let names: Vec<&str> = catalog.all().map(|d| d.name).collect();
        assert_eq!(names, ["MD", "NOP", "SLICE", "LABEL", "MIRROR"]);
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let catalog = ClassCatalog::new();
        assert_eq!(catalog.get("mirror").unwrap().kind, ClassKind::Aggregate);
        assert!(catalog.get("raid5").is_none());
        assert_eq!(catalog.create("label").unwrap().name(), "LABEL");
    }

    #[test]
    fn factories_match_descriptors() {
        let catalog = ClassCatalog::new();
        for descriptor in catalog.all() {
            let class = catalog.create(descriptor.name).unwrap();
            assert_eq!(class.name(), descriptor.name);
        }
    }

    #[test]
    fn register_all_twice_conflicts() {
        let mesh = Mesh::new();
        let catalog = ClassCatalog::new();
        assert_eq!(catalog.register_all(&mesh.handle()).unwrap().len(), 5);
        assert!(matches!(
            catalog.register_all(&mesh.handle()),
            Err(GeomError::NameConflict { kind: "class", .. })
        ));
    }
}
