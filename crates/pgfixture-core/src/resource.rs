use std::path::{Path, PathBuf};

const CLASSPATH_PREFIX: &str = "classpath:";
const FILE_PREFIX: &str = "file:";

/// Turns a script locator into a readable file.
///
/// `None` means the resource does not exist; callers skip it.
pub trait ResourceResolver {
    fn resolve(&self, locator: &str) -> Option<PathBuf>;
}

impl<F> ResourceResolver for F
where
    F: Fn(&str) -> Option<PathBuf>,
{
    fn resolve(&self, locator: &str) -> Option<PathBuf> {
        self(locator)
    }
}

/// Resolves locators against the filesystem.
///
/// `classpath:x` is looked up in each resource root in order. `file:x` and
/// bare `x` are taken relative to `base_dir` unless absolute.
#[derive(Debug, Clone)]
pub struct FsResourceResolver {
    base_dir: PathBuf,
    resource_roots: Vec<PathBuf>,
}

impl FsResourceResolver {
    /// Resolver whose only resource root is `base_dir` itself.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        Self {
            resource_roots: vec![base_dir.clone()],
            base_dir,
        }
    }

    #[must_use]
    pub fn with_resource_roots(mut self, roots: Vec<PathBuf>) -> Self {
        self.resource_roots = roots;
        self
    }

    /// Resolver rooted at the current directory.
    pub fn current_dir() -> std::io::Result<Self> {
        Ok(Self::new(std::env::current_dir()?))
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn resource_roots(&self) -> &[PathBuf] {
        &self.resource_roots
    }
}

impl ResourceResolver for FsResourceResolver {
    fn resolve(&self, locator: &str) -> Option<PathBuf> {
        if let Some(name) = locator.strip_prefix(CLASSPATH_PREFIX) {
            let name = name.trim_start_matches('/');
            return self
                .resource_roots
                .iter()
                .map(|root| root.join(name))
                .find(|p| p.is_file());
        }

        let path = Path::new(locator.strip_prefix(FILE_PREFIX).unwrap_or(locator));
        let path = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        };
        path.is_file().then_some(path)
    }
}
