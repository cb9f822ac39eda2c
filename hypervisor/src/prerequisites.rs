use std::os::unix::fs::PermissionsExt;
use std::path::Path;

/// Verify that the hypervisor binary and its execution prerequisites are
/// present. Collects every failure instead of stopping at the first one,
/// so an operator sees the full list of what's missing in one pass.
pub fn check_prerequisites(firecracker_bin: &Path, jailer_bin: &Path) -> Vec<String> {
    let mut errors = Vec::new();

    check_file_exists(firecracker_bin, "firecracker binary", &mut errors);
    check_executable(firecracker_bin, "firecracker binary", &mut errors);
    check_file_exists(jailer_bin, "jailer binary", &mut errors);
    check_executable(jailer_bin, "jailer binary", &mut errors);
    check_kvm(&mut errors);

    errors
}

fn check_file_exists(path: &Path, label: &str, errors: &mut Vec<String>) {
    if !path.exists() {
        errors.push(format!("{label} not found: {}", path.display()));
    }
}

fn check_executable(path: &Path, label: &str, errors: &mut Vec<String>) {
    if let Ok(meta) = path.metadata()
        && meta.permissions().mode() & 0o111 == 0
    {
        errors.push(format!("{label} is not executable: {}", path.display()));
    }
}

fn check_kvm(errors: &mut Vec<String>) {
    let kvm = Path::new("/dev/kvm");
    if !kvm.exists() {
        errors.push("/dev/kvm not found (KVM not available)".to_string());
    } else if let Err(e) = std::fs::File::options().read(true).write(true).open(kvm) {
        errors.push(format!("/dev/kvm not accessible: {e}"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_binaries_are_all_reported() {
        let errors = check_prerequisites(
            Path::new("/nonexistent/firecracker"),
            Path::new("/nonexistent/jailer"),
        );
        assert!(errors.iter().any(|e| e.contains("firecracker binary")));
        assert!(errors.iter().any(|e| e.contains("jailer binary")));
    }

    #[test]
    fn existing_executable_binary_has_no_complaint() {
        // `/bin/sh` is executable and present on any system this crate builds on.
        let errors = check_prerequisites(Path::new("/bin/sh"), Path::new("/nonexistent/jailer"));
        assert!(!errors.iter().any(|e| e.contains("firecracker binary")));
    }
}
