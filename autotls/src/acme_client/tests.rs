use super::*;
use crate::routes::RouteTable;
use crate::test_support::issued_bundle;

fn issuer(environment: Environment) -> AcmeIssuer {
    AcmeIssuer::new(environment, Http01Responder::new_routes(RouteTable::new()))
}

#[test]
fn directory_url_follows_environment() {
    assert!(issuer(Environment::Staging).directory_url().contains("staging"));
    assert!(issuer(Environment::Production)
        .directory_url()
        .contains("acme-v02"));
}

#[test]
fn make_csr_produces_der() {
    let key = KeyPair::generate().unwrap();
    let csr = make_csr(&key, "example.com").unwrap();
    assert!(!csr.is_empty());
    // DER-encoded CertificationRequest starts with a SEQUENCE tag
    assert_eq!(csr[0], 0x30);
}

#[test]
fn split_chain_separates_leaf_from_issuers() {
    let leaf = issued_bundle("example.com", Environment::Staging, 90).certificate_pem;
    let intermediate = issued_bundle("issuer.example", Environment::Staging, 365).certificate_pem;
    let root = issued_bundle("root.example", Environment::Staging, 3650).certificate_pem;
    let full = format!("{leaf}{intermediate}{root}");

    let (got_leaf, got_chain) = split_chain(&full).unwrap();
    assert_eq!(got_leaf.trim(), leaf.trim());
    assert_eq!(
        got_chain.matches("-----BEGIN CERTIFICATE-----").count(),
        2
    );
}

#[test]
fn split_chain_with_single_certificate_has_empty_chain() {
    let leaf = issued_bundle("example.com", Environment::Staging, 90).certificate_pem;
    let (got_leaf, got_chain) = split_chain(&leaf).unwrap();
    assert_eq!(got_leaf.trim(), leaf.trim());
    assert!(got_chain.is_empty());
}

#[test]
fn split_chain_rejects_garbage() {
    let err = split_chain("this is not pem").unwrap_err();
    assert!(matches!(err, IssuanceError::Finalize(_)));
}

#[test]
fn unsupported_challenge_error_names_the_domain() {
    let err = IssuanceError::ChallengeUnsupported {
        domain: "example.com".to_string(),
    };
    assert!(err.to_string().contains("example.com"));
    assert!(err.to_string().contains("http-01"));
}
