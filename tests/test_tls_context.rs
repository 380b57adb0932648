//! TLS context construction against the PEM fixtures in `tests/fixtures/tls`

use std::path::PathBuf;
use warren::config::{TlsSection, VerifyMode};
use warren::tls::{TlsContext, TlsError, TlsVersion};

fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures/tls")
        .join(name)
}

fn section() -> TlsSection {
    TlsSection {
        ca_certs: Some(fixture("ca_cert.pem")),
        ..TlsSection::default()
    }
}

#[test]
fn test_server_auth_only() {
    let context = TlsContext::build(&section()).unwrap();
    assert!(!context.is_mutual());
    assert_eq!(context.min_version(), TlsVersion::Tls12);
}

#[test]
fn test_mutual_tls_with_cert_and_key() {
    let context = TlsContext::build(&TlsSection {
        certfile: Some(fixture("client_cert.pem")),
        keyfile: Some(fixture("client_key.pem")),
        min_version: "TLSv1.3".to_string(),
        ..section()
    })
    .unwrap();
    assert!(context.is_mutual());
    assert_eq!(context.min_version(), TlsVersion::Tls13);
    // the identity is offered during the handshake
    assert!(context.client_config().client_auth_cert_resolver.has_certs());
}

#[test]
fn test_client_identity_survives_server_verification_off() {
    let context = TlsContext::build(&TlsSection {
        certfile: Some(fixture("client_cert.pem")),
        keyfile: Some(fixture("client_key.pem")),
        verify_mode: VerifyMode::None,
        ..section()
    })
    .unwrap();
    assert!(context.is_mutual());
    assert!(context.client_config().client_auth_cert_resolver.has_certs());
}

#[test]
fn test_cert_without_key_is_configuration_error() {
    let result = TlsContext::build(&TlsSection {
        certfile: Some(fixture("client_cert.pem")),
        ..section()
    });
    assert!(matches!(result, Err(TlsError::IncompleteClientIdentity)));
}

#[test]
fn test_key_without_cert_is_configuration_error() {
    let result = TlsContext::build(&TlsSection {
        keyfile: Some(fixture("client_key.pem")),
        ..section()
    });
    assert!(matches!(result, Err(TlsError::IncompleteClientIdentity)));
}

#[test]
fn test_ca_file_without_certificates() {
    let result = TlsContext::build(&TlsSection {
        ca_certs: Some(fixture("garbage.pem")),
        ..TlsSection::default()
    });
    assert!(matches!(result, Err(TlsError::NoCertificates(_))));
}

#[test]
fn test_certificate_file_as_key_has_no_private_key() {
    let result = TlsContext::build(&TlsSection {
        certfile: Some(fixture("client_cert.pem")),
        keyfile: Some(fixture("client_cert.pem")),
        ..section()
    });
    assert!(matches!(result, Err(TlsError::NoPrivateKey(_))));
}

#[test]
fn test_legacy_floor_rejected() {
    let result = TlsContext::build(&TlsSection {
        min_version: "TLSv1.1".to_string(),
        ..section()
    });
    assert!(matches!(result, Err(TlsError::UnsupportedVersion(_))));
}

#[test]
fn test_verification_can_be_disabled() {
    let context = TlsContext::build(&TlsSection {
        verify_mode: VerifyMode::None,
        ..section()
    })
    .unwrap();
    assert!(!context.is_mutual());
}
