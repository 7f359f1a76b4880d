//! Repositories and their compilation order.
//!
//! A repository is a named group of sources, identified by the first path
//! segment of a source id. Repositories are compiled dependencies first,
//! then by the length of their longest dependency chain, then by name.
//! Sources outside any repository come last.

use std::cmp::Ordering;
use std::fmt;

use indexmap::{IndexMap, IndexSet};
use smol_str::SmolStr;

/// Name prefix of repositories compiled together as [`Scope::Models`].
const MODEL_PREFIX: &str = "model";

#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Repository {
    pub name: SmolStr,
    pub dependencies: Vec<SmolStr>,
}

impl Repository {
    pub fn new(name: impl Into<SmolStr>) -> Self {
        Self {
            name: name.into(),
            dependencies: Vec::new(),
        }
    }

    pub fn with_dependency(mut self, dependency: impl Into<SmolStr>) -> Self {
        self.dependencies.push(dependency.into());
        self
    }
}

/// Known repositories. Unknown names compare as repositories without
/// dependencies.
#[derive(Clone, Debug, Default)]
pub struct RepositorySet {
    repositories: IndexMap<SmolStr, Repository>,
}

impl RepositorySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_repository(mut self, repository: Repository) -> Self {
        self.add(repository);
        self
    }

    pub fn add(&mut self, repository: Repository) {
        self.repositories.insert(repository.name.clone(), repository);
    }

    pub fn get(&self, name: &str) -> Option<&Repository> {
        self.repositories.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.repositories.keys().map(SmolStr::as_str)
    }

    /// Direct dependencies of `name`.
    pub fn dependencies(&self, name: &str) -> &[SmolStr] {
        self.get(name).map(|r| r.dependencies.as_slice()).unwrap_or(&[])
    }

    /// True when `name` depends on `other`, directly or transitively.
    pub fn depends_on(&self, name: &str, other: &str) -> bool {
        let mut seen = IndexSet::new();
        let mut stack: Vec<&str> = vec![name];
        while let Some(current) = stack.pop() {
            for dependency in self.dependencies(current) {
                if dependency == other {
                    return true;
                }
                if seen.insert(dependency.as_str()) {
                    stack.push(dependency);
                }
            }
        }
        false
    }

    /// Length of the longest dependency chain starting at `name`.
    /// Cycles are cut at the first repeated repository.
    pub fn depth(&self, name: &str) -> usize {
        let mut path = IndexSet::new();
        self.depth_inner(name, &mut path)
    }

    fn depth_inner<'a>(&'a self, name: &'a str, path: &mut IndexSet<&'a str>) -> usize {
        if !path.insert(name) {
            return 0;
        }
        let depth = self
            .dependencies(name)
            .iter()
            .map(|d| 1 + self.depth_inner(d, path))
            .max()
            .unwrap_or(0);
        path.pop();
        depth
    }

    /// Compilation order of two repositories; `None` is "no repository".
    pub fn compare(&self, a: Option<&str>, b: Option<&str>) -> Ordering {
        match (a, b) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Greater,
            (Some(_), None) => Ordering::Less,
            (Some(a), Some(b)) if a == b => Ordering::Equal,
            (Some(a), Some(b)) => {
                if self.depends_on(a, b) {
                    Ordering::Greater
                } else if self.depends_on(b, a) {
                    Ordering::Less
                } else {
                    self.depth(a).cmp(&self.depth(b)).then_with(|| a.cmp(b))
                }
            }
        }
    }

    /// Sort repository names into compilation order.
    pub fn sort<S: AsRef<str>>(&self, names: &mut [Option<S>]) {
        names.sort_by(|a, b| self.compare(a.as_ref().map(AsRef::as_ref), b.as_ref().map(AsRef::as_ref)));
    }

    /// Compilation scopes for a set of repositories, in order. Model
    /// repositories collapse into one [`Scope::Models`] at the position of
    /// the first of them.
    pub fn scopes<'a>(&self, repositories: impl IntoIterator<Item = Option<&'a str>>) -> Vec<Scope> {
        let mut names: Vec<Option<&str>> = repositories.into_iter().collect::<IndexSet<_>>().into_iter().collect();
        self.sort(&mut names);
        let mut scopes = Vec::new();
        for name in names {
            let scope = Scope::of(name);
            if !scopes.contains(&scope) {
                scopes.push(scope);
            }
        }
        scopes
    }
}

// ============================================================================
// SCOPE
// ============================================================================

/// The unit compiled in one transaction.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Scope {
    /// Everything, regardless of repository.
    All,
    /// Every repository whose name starts with `model`.
    Models,
    Repository(SmolStr),
    /// Sources outside any repository.
    Unassigned,
}

impl Scope {
    /// Scope compiling the given repository.
    pub fn of(repository: Option<&str>) -> Self {
        match repository {
            None => Self::Unassigned,
            Some(name) if name.starts_with(MODEL_PREFIX) => Self::Models,
            Some(name) => Self::Repository(SmolStr::new(name)),
        }
    }

    /// True when a node or source of `repository` is compiled in this scope.
    pub fn contains(&self, repository: Option<&str>) -> bool {
        match (self, repository) {
            (Self::All, _) => true,
            (Self::Unassigned, None) => true,
            (Self::Models, Some(name)) => name.starts_with(MODEL_PREFIX),
            (Self::Repository(scope), Some(name)) => scope == name,
            _ => false,
        }
    }

    /// Repository name handed to passes, if the scope has one.
    pub fn repository(&self) -> Option<&str> {
        match self {
            Self::Repository(name) => Some(name),
            _ => None,
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => f.write_str("Pure"),
            Self::Models => f.write_str("model-all"),
            Self::Repository(name) => f.write_str(name),
            Self::Unassigned => f.write_str("non-repository"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    fn repositories() -> RepositorySet {
        RepositorySet::new()
            .with_repository(Repository::new("platform"))
            .with_repository(Repository::new("core").with_dependency("platform"))
            .with_repository(Repository::new("model").with_dependency("core"))
            .with_repository(Repository::new("model_validation").with_dependency("platform"))
            .with_repository(Repository::new("zeta"))
    }

    #[test]
    fn test_dependencies_first() {
        let set = repositories();
        assert!(set.depends_on("model", "platform"));
        assert!(!set.depends_on("platform", "model"));
        assert_eq!(set.compare(Some("model"), Some("core")), Ordering::Greater);
        assert_eq!(set.compare(Some("platform"), Some("model")), Ordering::Less);
    }

    #[test]
    fn test_depth_then_name() {
        let set = repositories();
        assert_eq!(set.depth("platform"), 0);
        assert_eq!(set.depth("model"), 2);
        assert_eq!(set.compare(Some("zeta"), Some("platform")), Ordering::Greater);
        assert_eq!(set.compare(Some("zeta"), Some("model_validation")), Ordering::Less);
    }

    #[test]
    fn test_no_repository_last() {
        let set = repositories();
        let mut names = vec![None, Some("model"), Some("unknown"), Some("platform")];
        set.sort(&mut names);
        assert_eq!(names, vec![Some("platform"), Some("unknown"), Some("model"), None]);
    }

    #[test]
    fn test_cycles_terminate() {
        let set = RepositorySet::new()
            .with_repository(Repository::new("a").with_dependency("b"))
            .with_repository(Repository::new("b").with_dependency("a"));
        assert!(set.depends_on("a", "b"));
        assert_eq!(set.depth("a"), 2);
    }

    #[test]
    fn test_models_collapse() {
        let set = repositories();
        let scopes = set.scopes([Some("model_validation"), Some("model"), Some("platform"), None]);
        assert_eq!(
            scopes,
            vec![Scope::Repository("platform".into()), Scope::Models, Scope::Unassigned]
        );
    }

    #[rstest]
    #[case(Scope::All, None, true)]
    #[case(Scope::All, Some("x"), true)]
    #[case(Scope::Unassigned, None, true)]
    #[case(Scope::Unassigned, Some("x"), false)]
    #[case(Scope::Models, Some("model_extra"), true)]
    #[case(Scope::Models, Some("platform"), false)]
    #[case(Scope::Repository("platform".into()), Some("platform"), true)]
    #[case(Scope::Repository("platform".into()), None, false)]
    fn test_scope_contains(#[case] scope: Scope, #[case] repository: Option<&str>, #[case] expected: bool) {
        assert_eq!(scope.contains(repository), expected);
    }
}
