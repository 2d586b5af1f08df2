// WG Tunnel Manager - Mechanism Discovery
// Locates the backend executables the mechanisms drive

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::config::BackendConfig;

/// Where the primary executable was found
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutableLocation {
    Found(PathBuf),
    /// Nothing found; the bare name is used and left to the OS to resolve
    BareName(String),
}

impl ExecutableLocation {
    pub fn program(&self) -> String {
        match self {
            ExecutableLocation::Found(path) => path.to_string_lossy().into_owned(),
            ExecutableLocation::BareName(name) => name.clone(),
        }
    }

    pub fn is_found(&self) -> bool {
        matches!(self, ExecutableLocation::Found(_))
    }
}

/// Resolved program for every mechanism
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTools {
    pub primary: ExecutableLocation,
    pub service_program: String,
    pub quick_script: String,
    pub show_tool: String,
    pub adapter_program: String,
    pub interface_list_program: String,
}

#[derive(Debug, Clone)]
pub struct MechanismDiscovery {
    primary_name: String,
    well_known_dirs: Vec<PathBuf>,
    sibling_tools: Vec<String>,
    /// Overrides the process `PATH`
    search_path: Option<OsString>,
}

/// Append the platform executable suffix unless already present
fn executable_file_name(name: &str) -> String {
    let suffix = std::env::consts::EXE_SUFFIX;
    if suffix.is_empty() || name.to_ascii_lowercase().ends_with(suffix) {
        name.to_string()
    } else {
        format!("{}{}", name, suffix)
    }
}

impl MechanismDiscovery {
    pub fn new(backend: &BackendConfig) -> Self {
        Self {
            primary_name: backend.primary_executable.clone(),
            well_known_dirs: backend.well_known_dirs.clone(),
            sibling_tools: backend.sibling_tools.clone(),
            search_path: None,
        }
    }

    pub fn with_search_path(mut self, search_path: impl Into<OsString>) -> Self {
        self.search_path = Some(search_path.into());
        self
    }

    fn which(&self, program: &str) -> Option<PathBuf> {
        let found = match &self.search_path {
            Some(paths) => {
                let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
                which::which_in(program, Some(paths), cwd)
            }
            None => which::which(program),
        };
        found.ok()
    }

    fn in_well_known_dirs(&self, program: &str) -> Option<PathBuf> {
        let file_name = executable_file_name(program);
        self.well_known_dirs
            .iter()
            .map(|dir| dir.join(&file_name))
            .find(|candidate| candidate.is_file())
    }

    /// Well-known install directories, then the search path, then the
    /// directory of any sibling tool, then the bare name.
    pub fn locate_primary_executable(&self) -> ExecutableLocation {
        let name = self.primary_name.as_str();

        // A configured absolute path wins outright
        if Path::new(name).is_absolute() {
            return if Path::new(name).is_file() {
                ExecutableLocation::Found(PathBuf::from(name))
            } else {
                ExecutableLocation::BareName(name.to_string())
            };
        }

        if let Some(path) = self.in_well_known_dirs(name) {
            debug!("Found {} in well-known directory: {}", name, path.display());
            return ExecutableLocation::Found(path);
        }

        if let Some(path) = self.which(name) {
            debug!("Found {} on search path: {}", name, path.display());
            return ExecutableLocation::Found(path);
        }

        let file_name = executable_file_name(name);
        for tool in &self.sibling_tools {
            let Some(tool_path) = self.which(tool) else {
                continue;
            };
            if let Some(candidate) = tool_path.parent().map(|dir| dir.join(&file_name)) {
                if candidate.is_file() {
                    debug!("Found {} next to {}: {}", name, tool, candidate.display());
                    return ExecutableLocation::Found(candidate);
                }
            }
        }

        debug!("{} not found, falling back to bare name", name);
        ExecutableLocation::BareName(name.to_string())
    }

    /// Well-known directories, then the search path.
    pub fn locate_auxiliary_tool(&self, name: &str) -> Option<PathBuf> {
        if Path::new(name).is_absolute() {
            return Path::new(name).is_file().then(|| PathBuf::from(name));
        }
        self.in_well_known_dirs(name).or_else(|| self.which(name))
    }

    /// Resolve every program; auxiliaries fall back to their configured name.
    pub fn resolve(&self, backend: &BackendConfig) -> ResolvedTools {
        let aux = |name: &str| {
            self.locate_auxiliary_tool(name)
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_else(|| name.to_string())
        };
        ResolvedTools {
            primary: self.locate_primary_executable(),
            service_program: aux(&backend.service_program),
            quick_script: aux(&backend.quick_script),
            show_tool: aux(&backend.show_tool),
            adapter_program: aux(&backend.adapter_program),
            interface_list_program: aux(&backend.interface_list_program),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn discovery(well_known: Vec<PathBuf>, search_path: &Path) -> MechanismDiscovery {
        let backend = BackendConfig {
            primary_executable: "wireguard".to_string(),
            well_known_dirs: well_known,
            sibling_tools: vec!["wg".to_string(), "wg-quick".to_string()],
            ..Default::default()
        };
        MechanismDiscovery::new(&backend).with_search_path(search_path.as_os_str())
    }

    fn touch(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(executable_file_name(name));
        fs::write(&path, "").unwrap();
        path
    }

    #[cfg(unix)]
    fn make_executable(path: &Path) {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[test]
    fn test_well_known_directory_wins() {
        let install = TempDir::new().unwrap();
        let empty_path = TempDir::new().unwrap();
        let expected = touch(install.path(), "wireguard");

        let found = discovery(vec![install.path().to_path_buf()], empty_path.path())
            .locate_primary_executable();
        assert_eq!(found, ExecutableLocation::Found(expected));
    }

    #[test]
    fn test_missing_everywhere_is_bare_name() {
        let empty = TempDir::new().unwrap();
        let found = discovery(vec![empty.path().join("nope")], empty.path())
            .locate_primary_executable();
        assert_eq!(found, ExecutableLocation::BareName("wireguard".to_string()));
        assert!(!found.is_found());
        assert_eq!(found.program(), "wireguard");
    }

    #[cfg(unix)]
    #[test]
    fn test_search_path_lookup() {
        let bin = TempDir::new().unwrap();
        let path = touch(bin.path(), "wireguard");
        make_executable(&path);

        let found = discovery(Vec::new(), bin.path()).locate_primary_executable();
        assert_eq!(found, ExecutableLocation::Found(path));
    }

    #[cfg(unix)]
    #[test]
    fn test_sibling_tool_directory() {
        // Primary is present but not executable, so only the sibling
        // step can find it
        let bin = TempDir::new().unwrap();
        let primary = touch(bin.path(), "wireguard");
        let wg = touch(bin.path(), "wg");
        make_executable(&wg);

        let found = discovery(Vec::new(), bin.path()).locate_primary_executable();
        assert_eq!(found, ExecutableLocation::Found(primary));
    }

    #[cfg(unix)]
    #[test]
    fn test_auxiliary_tools_fall_back_to_configured_name() {
        let bin = TempDir::new().unwrap();
        let quick = touch(bin.path(), "wg-quick");
        make_executable(&quick);

        let backend = BackendConfig {
            well_known_dirs: Vec::new(),
            ..Default::default()
        };
        let tools = MechanismDiscovery::new(&backend)
            .with_search_path(bin.path().as_os_str())
            .resolve(&backend);
        assert_eq!(tools.quick_script, quick.to_string_lossy());
        assert_eq!(tools.show_tool, backend.show_tool);
    }
}
