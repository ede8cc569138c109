//! Validation and sealing of operator-supplied certificate pairs

use chrono::Utc;
use portico_cert::{generate_for_domains, validate_pair, PemError, SecretCipher};

#[test]
fn test_matching_pair_is_sealed_and_recovered() {
    let cert = generate_for_domains(&["shop.example.com".to_string()], 90).unwrap();
    let info = validate_pair(&cert.pem_cert, &cert.pem_key, "shop.example.com", Utc::now())
        .expect("pair should validate");
    assert!(info.covers("shop.example.com"));

    let cipher = SecretCipher::from_base64(&SecretCipher::generate_key().unwrap()).unwrap();
    let sealed = cipher.encrypt_str(&cert.pem_key).unwrap();
    assert!(!sealed.ciphertext.contains("PRIVATE KEY"));

    let key = cipher
        .decrypt_string(&sealed.ciphertext, &sealed.nonce)
        .unwrap();
    assert_eq!(key, cert.pem_key);
}

#[test]
fn test_key_from_another_certificate_is_rejected() {
    let cert = generate_for_domains(&["shop.example.com".to_string()], 90).unwrap();
    let stranger = generate_for_domains(&["shop.example.com".to_string()], 90).unwrap();

    let err = validate_pair(
        &cert.pem_cert,
        &stranger.pem_key,
        "shop.example.com",
        Utc::now(),
    )
    .unwrap_err();
    assert!(matches!(err, PemError::KeyMismatch));
}

#[test]
fn test_certificate_for_other_host_is_rejected() {
    let cert = generate_for_domains(&["other.example.com".to_string()], 90).unwrap();

    let err = validate_pair(&cert.pem_cert, &cert.pem_key, "shop.example.com", Utc::now())
        .unwrap_err();
    assert!(matches!(err, PemError::NameMismatch { .. }));
}
