/*!
Platform string normalization.

Follows the same normalization table containerd uses so that platform
strings compared across manifests, configuration, and the local builder all
land on the same `os/arch[/variant]` form.
*/

/// Normalize an architecture and variant pair.
pub fn normalize_architecture(arch: &str, variant: &str) -> (String, String) {
    let arch = arch.to_lowercase();
    let variant = variant.to_lowercase();
    match arch.as_str() {
        "i386" => ("386".to_string(), String::new()),
        "x86_64" | "x86-64" => ("amd64".to_string(), String::new()),
        "aarch64" | "arm64" => {
            let variant = if variant == "8" || variant == "v8" {
                String::new()
            } else {
                variant
            };
            ("arm64".to_string(), variant)
        }
        "armhf" => ("arm".to_string(), "v7".to_string()),
        "armel" => ("arm".to_string(), "v6".to_string()),
        "arm" => {
            let variant = match variant.as_str() {
                "" | "7" => "v7".to_string(),
                "5" | "6" | "8" => format!("v{variant}"),
                _ => variant,
            };
            ("arm".to_string(), variant)
        }
        _ => (arch, variant),
    }
}

/// Normalize and join a full platform triple into its string form.
pub fn normalize_platform(os: &str, arch: &str, variant: &str) -> String {
    let (arch, variant) = normalize_architecture(arch, variant);
    if variant.is_empty() {
        format!("{os}/{arch}")
    } else {
        format!("{os}/{arch}/{variant}")
    }
}

/// Split a platform string into its (os, architecture, variant) parts.
pub fn split_platform(platform: &str) -> (String, String, String) {
    let mut parts = platform.splitn(3, '/');
    (
        parts.next().unwrap_or("").to_string(),
        parts.next().unwrap_or("").to_string(),
        parts.next().unwrap_or("").to_string(),
    )
}

/// Normalize a platform string like `linux/arm64/v8` into `linux/arm64`. A
/// bare architecture is assumed to be a Linux platform.
pub fn normalize_platform_string(platform: &str) -> String {
    let parts: Vec<&str> = platform.splitn(3, '/').collect();
    match parts.as_slice() {
        [arch] => normalize_platform("linux", arch, ""),
        [os, arch] => normalize_platform(os, arch, ""),
        [os, arch, variant] => normalize_platform(os, arch, variant),
        _ => normalize_platform("linux", platform, ""),
    }
}

/// Platform string for the machine this process runs on. The operating
/// system is always reported as `linux` since that is what the container
/// builder targets.
pub fn client_platform() -> String {
    normalize_platform("linux", std::env::consts::ARCH, "")
}
