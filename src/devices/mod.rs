// Capture device presence probing

pub mod health;

use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Answers whether the capture device is present and usable
pub trait DeviceProbe: Send + Sync + 'static {
    /// Blocking; run through `probe_device` from async code
    fn is_available(&self) -> bool;
}

/// Run a probe on the blocking pool. A panicking probe counts as absent.
pub async fn probe_device(probe: &Arc<dyn DeviceProbe>) -> bool {
    let probe = probe.clone();
    match tokio::task::spawn_blocking(move || probe.is_available()).await {
        Ok(available) => available,
        Err(e) => {
            log::warn!("Device probe task failed: {}", e);
            false
        }
    }
}

/// Probe for a V4L2 device node
///
/// The node existing is not enough: a camera that was yanked mid-stream can
/// leave a node behind that fails every ioctl, and a camera held by another
/// process reports busy. Both count as absent.
pub struct V4l2Probe {
    device: PathBuf,
}

impl V4l2Probe {
    pub fn new(device: impl Into<PathBuf>) -> Self {
        Self {
            device: device.into(),
        }
    }
}

impl DeviceProbe for V4l2Probe {
    fn is_available(&self) -> bool {
        if !self.device.exists() {
            return false;
        }
        query_capabilities(&self.device)
    }
}

#[cfg(target_os = "linux")]
fn query_capabilities(device: &Path) -> bool {
    use std::fs::OpenOptions;
    use std::os::unix::fs::OpenOptionsExt;
    use std::os::unix::io::AsRawFd;

    // _IOR('V', 0, struct v4l2_capability)
    const VIDIOC_QUERYCAP: libc::c_ulong = 0x8068_5600;
    // sizeof(struct v4l2_capability)
    const CAPABILITY_SIZE: usize = 104;

    let file = match OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(device)
    {
        Ok(file) => file,
        Err(e) => {
            log::debug!("Cannot open {}: {}", device.display(), e);
            return false;
        }
    };

    let mut caps = [0u8; CAPABILITY_SIZE];
    // SAFETY: the buffer is the size the ioctl writes and outlives the call
    let rc = unsafe { libc::ioctl(file.as_raw_fd(), VIDIOC_QUERYCAP as _, caps.as_mut_ptr()) };
    if rc == 0 {
        return true;
    }

    let err = std::io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::EBUSY) | Some(libc::EIO) | Some(libc::ENODEV) | Some(libc::ENXIO) => {
            log::debug!("{} present but unusable: {}", device.display(), err);
            false
        }
        // Not a V4L2 node or the query is unsupported; the node itself opened fine
        Some(libc::ENOTTY) | Some(libc::EINVAL) => true,
        _ => {
            log::debug!("VIDIOC_QUERYCAP on {} failed: {}", device.display(), err);
            false
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn query_capabilities(device: &Path) -> bool {
    std::fs::File::open(device).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Fixed(AtomicBool);

    impl DeviceProbe for Fixed {
        fn is_available(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn missing_node_is_absent() {
        let probe = V4l2Probe::new("/dev/kiosk-replay-no-such-video");
        assert!(!probe.is_available());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn regular_file_counts_as_present() {
        // A plain file rejects the ioctl with ENOTTY
        let file = tempfile::NamedTempFile::new().unwrap();
        let probe = V4l2Probe::new(file.path());
        assert!(probe.is_available());
    }

    #[tokio::test]
    async fn probe_runs_off_the_runtime() {
        let probe: Arc<dyn DeviceProbe> = Arc::new(Fixed(AtomicBool::new(true)));
        assert!(probe_device(&probe).await);
    }
}
