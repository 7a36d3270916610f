//! Container profiles: the per-tag launch environment registry.
//!
//! A profile maps a worker tag to its resource defaults and the command
//! prefix that enters its container (runtime, bind mounts, image path).
//! Profiles must be registered before a tag can be scaled; an unregistered
//! tag is a configuration error, raised immediately and never retried.

use std::collections::HashMap;

use thiserror::Error;

/// Errors from profile registration and lookup.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProfileError {
    /// The tag has no registered container profile.
    #[error("unrecognized tag {0:?}; register a container profile for it first")]
    UnknownTag(String),

    /// A memory string that cannot be parsed.
    #[error("invalid memory amount {0:?}")]
    InvalidMemory(String),
}

/// Container runtime used to enter a profile's environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerRuntime {
    Apptainer,
    Docker,
}

impl ContainerRuntime {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Apptainer => "apptainer",
            Self::Docker => "docker",
        }
    }

    /// The subcommand that runs a program inside a container.
    pub fn directive(&self) -> &'static str {
        match self {
            Self::Apptainer => "exec",
            Self::Docker => "run",
        }
    }
}

/// One worker flavor: resource needs plus container entry command.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerProfile {
    pub tag: String,
    pub cpus: u32,
    pub memory_gib: u64,
    pub image_path: String,
    /// host-path -> container-path bind mounts.
    pub binds: Vec<(String, String)>,
}

impl ContainerProfile {
    pub fn new(tag: &str, cpus: u32, memory_gib: u64, image_path: &str) -> Self {
        Self {
            tag: tag.to_lowercase(),
            cpus,
            memory_gib,
            image_path: image_path.to_string(),
            binds: Vec::new(),
        }
    }

    /// Bind a host path into the container; defaults to the same path.
    pub fn with_bind(mut self, src: &str, dst: Option<&str>) -> Self {
        self.binds
            .push((src.to_string(), dst.unwrap_or(src).to_string()));
        self
    }

    /// Command prefix entering this profile's container.
    pub fn launch_prefix(&self, runtime: ContainerRuntime) -> Vec<String> {
        let mut command = vec![runtime.as_str().to_string(), runtime.directive().to_string()];
        for (src, dst) in &self.binds {
            command.push("--bind".to_string());
            command.push(format!("{src}:{dst}"));
        }
        command.push(self.image_path.clone());
        command
    }
}

/// Registry of container profiles, keyed by lowercase tag.
#[derive(Debug)]
pub struct ProfileRegistry {
    runtime: ContainerRuntime,
    profiles: HashMap<String, ContainerProfile>,
}

impl Default for ProfileRegistry {
    fn default() -> Self {
        Self {
            runtime: ContainerRuntime::Apptainer,
            profiles: HashMap::new(),
        }
    }
}

impl ProfileRegistry {
    pub fn new(runtime: ContainerRuntime) -> Self {
        Self {
            runtime,
            profiles: HashMap::new(),
        }
    }

    pub fn runtime(&self) -> ContainerRuntime {
        self.runtime
    }

    pub fn register(&mut self, profile: ContainerProfile) {
        self.profiles.insert(profile.tag.clone(), profile);
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.profiles.contains_key(&tag.to_lowercase())
    }

    pub fn get(&self, tag: &str) -> Result<&ContainerProfile, ProfileError> {
        self.profiles
            .get(&tag.to_lowercase())
            .ok_or_else(|| ProfileError::UnknownTag(tag.to_string()))
    }
}

/// Parse a human memory amount ("4GB", "16GiB", "2048MB") into whole GiB,
/// rounding down. A bare number is already GiB.
pub fn parse_memory_gib(amount: &str) -> Result<u64, ProfileError> {
    let trimmed = amount.trim();
    let digits_end = trimmed
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(trimmed.len());
    let (number, unit) = trimmed.split_at(digits_end);
    let value: f64 = number
        .parse()
        .map_err(|_| ProfileError::InvalidMemory(amount.to_string()))?;

    let gib = match unit.trim().to_lowercase().as_str() {
        "" | "g" | "gb" | "gib" => value,
        "m" | "mb" | "mib" => value / 1024.0,
        "t" | "tb" | "tib" => value * 1024.0,
        "k" | "kb" | "kib" => value / (1024.0 * 1024.0),
        "b" => value / (1024.0 * 1024.0 * 1024.0),
        _ => return Err(ProfileError::InvalidMemory(amount.to_string())),
    };

    Ok(gib as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_launch_prefix_apptainer() {
        let profile = ContainerProfile::new("gcam", 4, 8, "/containers/gcam.sif")
            .with_bind("/scratch", None)
            .with_bind("/data", Some("/mnt/data"));
        assert_eq!(
            profile.launch_prefix(ContainerRuntime::Apptainer),
            vec![
                "apptainer",
                "exec",
                "--bind",
                "/scratch:/scratch",
                "--bind",
                "/data:/mnt/data",
                "/containers/gcam.sif"
            ]
        );
    }

    #[test]
    fn test_launch_prefix_docker_directive() {
        let profile = ContainerProfile::new("stitches", 2, 4, "stitches:latest");
        let command = profile.launch_prefix(ContainerRuntime::Docker);
        assert_eq!(&command[..2], &["docker", "run"]);
    }

    #[test]
    fn test_registry_tag_case_insensitive() {
        let mut registry = ProfileRegistry::default();
        registry.register(ContainerProfile::new("GCAM", 4, 8, "/c/gcam.sif"));
        assert!(registry.contains("gcam"));
        assert_eq!(registry.get("Gcam").unwrap().cpus, 4);
    }

    #[test]
    fn test_registry_unknown_tag() {
        let registry = ProfileRegistry::default();
        assert_eq!(
            registry.get("missing"),
            Err(ProfileError::UnknownTag("missing".to_string()))
        );
    }

    #[rstest::rstest]
    #[case("16", 16)]
    #[case("4GB", 4)]
    #[case("16GiB", 16)]
    #[case("2048MB", 2)]
    #[case("2TB", 2048)]
    #[case("1.5g", 1)]
    #[case(" 8 GB ", 8)]
    fn test_parse_memory_gib(#[case] amount: &str, #[case] expected: u64) {
        assert_eq!(parse_memory_gib(amount), Ok(expected));
    }

    #[test]
    fn test_parse_memory_gib_rejects_garbage() {
        assert!(parse_memory_gib("lots").is_err());
        assert!(parse_memory_gib("4XB").is_err());
    }
}
