use chrono::{DateTime, TimeZone, Utc};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rsa::pkcs1v15::{Signature, SigningKey};
use rsa::pkcs8::EncodePublicKey;
use rsa::RsaPrivateKey;
use sello_core::canonical::{
    CanonicalError, Canonicalizer, CanonicalizerOptions, StagedStylesheet, StylesheetResolver,
};
use sello_core::certificate::SigningCertificate;
use sello_core::clock::FixedClock;
use sello_core::document::{DocumentKind, DocumentSnapshot, Element, Node};
use sello_core::engine::SealEngine;
use sello_core::key::{decode_private_key, KeySource};
use sello_core::material::{MaterialError, SigningMaterial};
use sello_core::normalize::Normalizer;
use sha2::Sha256;
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::Duration;
use tempfile::TempDir;
use x509_cert::builder::{Builder, CertificateBuilder, Profile};
use x509_cert::der::{Decode, Encode};
use x509_cert::name::Name;
use x509_cert::serial_number::SerialNumber;
use x509_cert::spki::SubjectPublicKeyInfoOwned;
use x509_cert::time::Validity;

#[allow(dead_code)]
pub const SERIAL: &str = "30001000000500003416";

const NOOP_STYLESHEET: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<xsl:stylesheet version="1.0" xmlns:xsl="http://www.w3.org/1999/XSL/Transform">
  <xsl:include href="utilerias.xslt"/>
  <xsl:include href="http://www.sat.gob.mx/sitio_internet/cfd/Pagos/Pagos20.xslt"/>
  <xsl:include href="http://www.sat.gob.mx/sitio_internet/cfd/implocal/implocal.xslt"/>
  <xsl:output method="text" encoding="UTF-8"/>
</xsl:stylesheet>
"#;

const UTILITIES: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<xsl:stylesheet version="1.0" xmlns:xsl="http://www.w3.org/1999/XSL/Transform"/>
"#;

const PAYMENTS: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<xsl:stylesheet version="1.0" xmlns:xsl="http://www.w3.org/1999/XSL/Transform" xmlns:pago20="http://www.sat.gob.mx/Pagos20">
  <xsl:template match="pago20:Pagos"/>
</xsl:stylesheet>
"#;

/// 2024-05-10T12:00:00 at UTC-06:00.
#[allow(dead_code)]
pub fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 10, 18, 0, 0).unwrap()
}

#[allow(dead_code)]
pub fn test_key() -> &'static RsaPrivateKey {
    static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
    KEY.get_or_init(|| {
        let mut rng = StdRng::seed_from_u64(42);
        RsaPrivateKey::new(&mut rng, 1024).expect("generate key")
    })
}

#[allow(dead_code)]
pub fn other_key() -> &'static RsaPrivateKey {
    static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
    KEY.get_or_init(|| {
        let mut rng = StdRng::seed_from_u64(43);
        RsaPrivateKey::new(&mut rng, 1024).expect("generate key")
    })
}

/// Self-signed DER certificate for `key` whose serial holds `serial` as ASCII.
#[allow(dead_code)]
pub fn certificate_der(key: &RsaPrivateKey, serial: &str) -> Vec<u8> {
    let signer = SigningKey::<Sha256>::new(key.clone());
    let spki_der = key
        .to_public_key()
        .to_public_key_der()
        .expect("public key der");
    let spki = SubjectPublicKeyInfoOwned::from_der(spki_der.as_bytes()).expect("spki");
    let subject = Name::from_str(
        "CN=ESCUELA KEMPER URGATE SA DE CV,2.5.4.45=EKU9003173C9 / VADA800927DJ3,C=MX",
    )
    .expect("subject");
    let serial = SerialNumber::new(serial.as_bytes()).expect("serial");
    let validity = Validity::from_now(Duration::from_secs(3600)).expect("validity");
    let builder = CertificateBuilder::new(Profile::Root, serial, validity, subject, spki, &signer)
        .expect("builder");
    let cert = builder.build::<Signature>().expect("certificate");
    cert.to_der().expect("certificate der")
}

#[allow(dead_code)]
pub fn material() -> SigningMaterial {
    material_for(test_key(), test_key())
}

/// Material whose key is `key` and whose certificate was issued for `cert_key`.
#[allow(dead_code)]
pub fn material_for(key: &RsaPrivateKey, cert_key: &RsaPrivateKey) -> SigningMaterial {
    try_material_for(key, cert_key).expect("material")
}

#[allow(dead_code)]
pub fn try_material_for(
    key: &RsaPrivateKey,
    cert_key: &RsaPrivateKey,
) -> Result<SigningMaterial, MaterialError> {
    use rsa::pkcs8::EncodePrivateKey;
    let der = key.to_pkcs8_der().expect("pkcs8 der");
    let decoded = decode_private_key(&KeySource::new(der.as_bytes()))?;
    let certificate = SigningCertificate::from_der(&certificate_der(cert_key, SERIAL))?;
    SigningMaterial::from_parts(decoded, certificate)
}

/// Directory with a stylesheet for every kind plus the utility and payment
/// sub-templates. The local-taxes sub-template is left out on purpose.
#[allow(dead_code)]
pub fn stylesheet_dir() -> TempDir {
    let dir = tempfile::tempdir().expect("tempdir");
    let options = CanonicalizerOptions::default();
    for kind in DocumentKind::ALL {
        std::fs::write(dir.path().join(options.stylesheet(kind)), NOOP_STYLESHEET)
            .expect("write stylesheet");
    }
    for (name, body) in [("utilerias.xslt", UTILITIES), ("Pagos20.xslt", PAYMENTS)] {
        std::fs::write(dir.path().join(name), body).expect("write sub-template");
    }
    dir
}

/// Stand-in for the authority's stylesheet: every attribute value in document
/// order, xmlns declarations excluded, framed as `||a|b|c||`.
#[allow(dead_code)]
pub fn pipe_transform(_: &StagedStylesheet, xml: &str) -> Result<String, CanonicalError> {
    let doc = DocumentSnapshot::parse(xml).map_err(|e| CanonicalError::Unavailable {
        kind: DocumentKind::Invoice,
        detail: e.to_string(),
    })?;
    let mut values = Vec::new();
    collect_values(doc.root(), &mut values);
    Ok(format!("||{}||", values.join("|")))
}

fn collect_values(element: &Element, out: &mut Vec<String>) {
    for attr in element.attributes.iter() {
        if attr.name != "xmlns" && !attr.name.starts_with("xmlns:") {
            out.push(attr.value.clone());
        }
    }
    for child in &element.children {
        if let Node::Element(el) = child {
            collect_values(el, out);
        }
    }
}

#[allow(dead_code)]
pub fn canonicalizer(dir: &TempDir) -> Canonicalizer {
    Canonicalizer::new(
        StylesheetResolver::new(vec![dir.path().to_path_buf()]),
        pipe_transform,
        CanonicalizerOptions::default(),
    )
}

#[allow(dead_code)]
pub fn engine(dir: &TempDir, material: Result<SigningMaterial, MaterialError>) -> SealEngine {
    SealEngine::new(material, canonicalizer(dir), Normalizer::default())
        .with_clock(FixedClock(now()))
}

#[allow(dead_code)]
pub fn invoice_xml(fecha: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<cfdi:Comprobante xmlns:cfdi="http://www.sat.gob.mx/cfd/4" xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance" Version="4.0" Serie="A" Folio="1001" Fecha="{fecha}" FormaPago="03" SubTotal="1000.00" Moneda="MXN" Total="1160.00" TipoDeComprobante="I" Exportacion="01" MetodoPago="PUE" LugarExpedicion="45079">
  <cfdi:Emisor Rfc="EKU9003173C9" Nombre="ESCUELA KEMPER URGATE" RegimenFiscal="601"/>
  <cfdi:Receptor Rfc="URE180429TM6" Nombre="UNIVERSIDAD ROBOTICA ESPAÑOLA" DomicilioFiscalReceptor="86991" RegimenFiscalReceptor="612" UsoCFDI="D01"/>
  <cfdi:Conceptos>
    <cfdi:Concepto ClaveProdServ="01010101" Cantidad="1" ClaveUnidad="H87" Descripcion="Servicio &amp; soporte" ValorUnitario="1000.00" Importe="1000.00" ObjetoImp="02"/>
  </cfdi:Conceptos>
</cfdi:Comprobante>
"#
    )
}

#[allow(dead_code)]
pub fn payment_xml() -> String {
    r#"<cfdi:Comprobante xmlns:cfdi="http://www.sat.gob.mx/cfd/4" xmlns:pago20="http://www.sat.gob.mx/Pagos20" Version="4.0" Fecha="2024-05-10T11:59:00" SubTotal="500.00" Moneda="MXN" TipoCambio="1" Total="580.00" TipoDeComprobante="P" FormaPago="03" MetodoPago="PUE" LugarExpedicion="45079"><cfdi:Emisor Rfc="EKU9003173C9" RegimenFiscal="601"/><cfdi:Receptor Rfc="XAXX010101000" RegimenFiscalReceptor="616" UsoCFDI="G03"/><cfdi:Complemento><pago20:Pagos Version="2.0"/></cfdi:Complemento></cfdi:Comprobante>"#
        .to_string()
}
