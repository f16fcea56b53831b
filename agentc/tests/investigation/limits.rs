//! Memory ceilings enforced through the host's limit wrappers.
#![cfg(target_os = "linux")]

use agentc::core::cancel::CancelToken;
use agentc::core::spec::{IsolationLevel, ResourceLimits, TeeSpec};
use agentc::error::{Error, Resource};
use agentc::io::config::TeeConfig;
use agentc::tee::{ExecRequest, create_tee};

#[test]
#[ignore]
fn allocation_over_the_ceiling_is_resource_exceeded() {
    let spec = TeeSpec {
        isolation: IsolationLevel::Process,
        limits: ResourceLimits {
            memory_mb: 128,
            cpu_cores: 1.0,
            timeout_sec: 20,
        },
        network_access: false,
        filesystem_access: false,
    };
    let cfg = TeeConfig {
        strict: true,
        ..TeeConfig::default()
    };
    let mut tee = create_tee(&spec, &cfg);
    tee.start()
        .expect("start (needs prlimit, bwrap and unprivileged user namespaces)");
    let request = ExecRequest::new("python3").args(["-c", "b = bytearray(512 * 1024 * 1024)"]);
    let err = tee
        .execute(&request, &CancelToken::new())
        .expect_err("allocation must fail");
    assert!(
        matches!(
            err,
            Error::ResourceExceeded {
                resource: Resource::Memory,
                ..
            }
        ),
        "unexpected {err:?}"
    );

    let ok = tee
        .execute(
            &ExecRequest::new("python3").args(["-c", "print(len(bytearray(1024)))"]),
            &CancelToken::new(),
        )
        .expect("small allocation");
    assert_eq!(ok.stdout_lossy().trim(), "1024");
    tee.stop().expect("stop");
}
