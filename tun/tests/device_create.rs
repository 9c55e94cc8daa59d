#![allow(clippy::unwrap_used)]
#![cfg(any(target_os = "linux", target_os = "macos"))]

use tun::TunDevice;

fn logger() {
    tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("debug")
        .try_init()
        .ok();
}

#[cfg(target_os = "linux")]
mod linux {
    use super::*;
    use std::os::fd::AsRawFd;
    use tun::{AsyncTunDevice, Mode, setup};

    #[test]
    #[ignore = "Needs root and modifies the host network stack"]
    fn kernel_assigns_distinct_names() {
        logger();

        let first = TunDevice::create("", Mode::Tun, false).unwrap();
        let second = TunDevice::create("", Mode::Tun, false).unwrap();

        assert!(first.name().starts_with("tun"));
        assert!(second.name().starts_with("tun"));
        assert_ne!(first.name(), second.name());
    }

    #[test]
    #[ignore = "Needs root and modifies the host network stack"]
    fn confirmed_name_is_bounded_for_all_modes() {
        logger();

        for mode in [Mode::Tun, Mode::Tap] {
            for packet_info in [false, true] {
                let device = TunDevice::create("", mode, packet_info).unwrap();

                assert!(!device.name().is_empty());
                assert!(device.name().len() <= 32);
            }
        }
    }

    #[test]
    #[ignore = "Needs root and modifies the host network stack"]
    fn duplicate_name_is_rejected_while_first_device_is_alive() {
        logger();

        let first = TunDevice::create("tuntest9", Mode::Tun, false).unwrap();

        let err = TunDevice::create("tuntest9", Mode::Tun, false).unwrap_err();

        assert_eq!(err.raw_os_error(), Some(libc::EBUSY));

        // The surviving device is untouched by the failed attempt.
        assert_eq!(first.name(), "tuntest9");
    }

    #[test]
    #[ignore = "Needs root and modifies the host network stack"]
    fn setup_leaves_callers_fd_open_on_failure() {
        logger();

        let device = TunDevice::create("tuntest8", Mode::Tun, false).unwrap();

        // A second fd cannot claim the same name, but stays usable.
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/net/tun")
            .unwrap();

        setup(file.as_raw_fd(), "tuntest8", Mode::Tun, false).unwrap_err();

        let name = setup(file.as_raw_fd(), "", Mode::Tun, false).unwrap();
        assert!(!name.is_empty());

        drop(device);
    }

    #[tokio::test]
    #[ignore = "Needs root and modifies the host network stack"]
    async fn device_registers_with_the_reactor() {
        logger();

        let device = TunDevice::create("", Mode::Tun, false).unwrap();
        let name = device.name().to_owned();

        let device = AsyncTunDevice::new(device).unwrap();

        assert_eq!(device.name(), name);
    }
}

#[cfg(target_os = "macos")]
mod macos {
    use super::*;
    use tun::{is_in_use, setup};

    #[test]
    #[ignore = "Needs root and modifies the host network stack"]
    fn second_claim_on_a_unit_fails_until_the_first_is_closed() {
        logger();

        let device = TunDevice::create(7).unwrap();
        assert_eq!(device.name(), "utun7");

        let err = setup(7).unwrap_err();
        assert!(is_in_use(&err));

        drop(device);

        let fd = setup(7).unwrap();
        drop(fd);
    }

    #[test]
    #[ignore = "Needs root and modifies the host network stack"]
    fn create_any_skips_units_in_use() {
        logger();

        let first = TunDevice::create_any().unwrap();
        let second = TunDevice::create_any().unwrap();

        assert_ne!(first.name(), second.name());
    }
}
