//! Tang pin: network-bound key recovery via the McCallum-Relyea exchange.
//!
//! At binding time clevis derived the content key from ECDH against the
//! Tang server's exchange key and threw its own private scalar away, so the
//! key can only come back with the server's help. Recovery blinds the
//! stored public point with an ephemeral scalar, asks the server to apply
//! its secret, and unblinds the result. The server never learns the
//! recovered key.

use anyhow::{anyhow, bail, Context, Result};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::jwe::{b64url_decode, b64url_encode, concat_kdf_sha256, ec_jwk_thumbprint, Jwe};

const RECOVERY_ATTEMPTS: u32 = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EcJwk {
    pub kty: String,
    pub crv: String,
    pub x: String,
    pub y: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_ops: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alg: Option<String>,
}

impl EcJwk {
    pub fn thumbprint(&self) -> String {
        ec_jwk_thumbprint(&self.crv, &self.x, &self.y)
    }

    fn derive_capable(&self) -> bool {
        match &self.key_ops {
            Some(ops) => ops.iter().any(|o| o == "deriveKey"),
            // tang servers older than key_ops mark exchange keys with ECMR
            None => self.alg.as_deref() == Some("ECMR"),
        }
    }
}

#[derive(Debug, Deserialize)]
struct KeySet {
    keys: Vec<EcJwk>,
}

/// Recover the CEK for a tang-bound JWE.
pub async fn recover(jwe: &Jwe) -> Result<Vec<u8>> {
    let config = jwe.clevis()?.get("tang").context("no tang config")?;
    let url = config
        .get("url")
        .and_then(|v| v.as_str())
        .context("tang config has no url")?
        .trim_end_matches('/')
        .to_string();

    let epk: EcJwk = serde_json::from_value(
        jwe.header
            .get("epk")
            .context("tang jwe has no epk")?
            .clone(),
    )
    .context("malformed epk")?;
    let kid = jwe.header.get("kid").and_then(|v| v.as_str());

    // The advertisement is usually embedded at binding time; fall back to
    // fetching it. Either way the key we use must match the stored kid.
    let server_key = match config.get("adv") {
        Some(adv) => select_exchange_key(adv, &epk.crv, kid)?,
        None => {
            let adv = fetch_adv(&url).await?;
            select_exchange_key(&adv, &epk.crv, kid)?
        }
    };

    let exchange = ExchangeState::start(&epk, &server_key)?;
    let response = post_recovery(&url, &server_key.thumbprint(), &exchange.blinded).await?;
    let z = exchange.finish(&response)?;

    let enc = jwe.enc().context("tang jwe has no enc")?;
    let apu = jwe
        .header
        .get("apu")
        .and_then(|v| v.as_str())
        .map(b64url_decode)
        .transpose()?
        .unwrap_or_default();
    let apv = jwe
        .header
        .get("apv")
        .and_then(|v| v.as_str())
        .map(b64url_decode)
        .transpose()?
        .unwrap_or_default();

    let key_len = match enc {
        "A256GCM" => 32,
        other => bail!("unsupported tang jwe enc {}", other),
    };
    Ok(concat_kdf_sha256(&z, enc, &apu, &apv, key_len))
}

/// Pick the derive-capable key from an advertisement, preferring the one
/// whose thumbprint the binding recorded.
fn select_exchange_key(
    adv: &serde_json::Value,
    crv: &str,
    kid: Option<&str>,
) -> Result<EcJwk> {
    let payload = adv
        .get("payload")
        .and_then(|v| v.as_str())
        .context("advertisement has no payload")?;
    let keyset: KeySet = serde_json::from_slice(&b64url_decode(payload)?)
        .context("unable to parse advertisement key set")?;

    let candidates: Vec<&EcJwk> = keyset
        .keys
        .iter()
        .filter(|k| k.kty == "EC" && k.crv == crv && k.derive_capable())
        .collect();

    if let Some(kid) = kid {
        for key in &candidates {
            if key.thumbprint() == kid {
                return Ok((*key).clone());
            }
        }
        warn!("no advertised key matches the recorded thumbprint, trying the first exchange key");
    }

    candidates
        .first()
        .map(|k| (*k).clone())
        .context("advertisement carries no usable exchange key")
}

async fn fetch_adv(url: &str) -> Result<serde_json::Value> {
    let adv_url = format!("{}/adv", url);
    debug!("fetching tang advertisement from {}", adv_url);
    retrying(|| async {
        reqwest::Client::new()
            .get(&adv_url)
            .send()
            .await?
            .error_for_status()?
            .json::<serde_json::Value>()
            .await
            .map_err(anyhow::Error::from)
    })
    .await
    .with_context(|| format!("unable to fetch tang advertisement from {}", adv_url))
}

async fn post_recovery(url: &str, thp: &str, blinded: &EcJwk) -> Result<EcJwk> {
    let rec_url = format!("{}/rec/{}", url, thp);
    let body = serde_json::to_string(blinded)?;
    debug!("posting recovery request to {}", rec_url);
    retrying(|| async {
        reqwest::Client::new()
            .post(&rec_url)
            .header("Content-Type", "application/jwk+json")
            .body(body.clone())
            .send()
            .await?
            .error_for_status()?
            .json::<EcJwk>()
            .await
            .map_err(anyhow::Error::from)
    })
    .await
    .with_context(|| format!("tang recovery request to {} failed", rec_url))
}

/// Network errors are transient while interfaces come up; retry with
/// backoff instead of burning the unlock attempt.
async fn retrying<T, F, Fut>(mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut delay = Duration::from_millis(250);
    let mut last_err = None;
    for _ in 0..RECOVERY_ATTEMPTS {
        match f().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                debug!("tang request failed, retrying: {:#}", e);
                last_err = Some(e);
            }
        }
        tokio::time::sleep(delay).await;
        delay = (delay * 2).min(Duration::from_secs(3));
    }
    Err(last_err.unwrap_or_else(|| anyhow!("tang recovery failed")))
}

/// One blinded exchange, generic over the two curves tang deploys.
enum Exchange {
    P256 {
        eph: ::p256::NonZeroScalar,
        server: ::p256::ProjectivePoint,
    },
    P521 {
        eph: ::p521::NonZeroScalar,
        server: ::p521::ProjectivePoint,
    },
}

struct ExchangeState {
    blinded: EcJwk,
    inner: Exchange,
}

macro_rules! curve_ops {
    ($curve:ident, $field_len:expr, $crv_name:expr) => {
        mod $curve {
            use super::*;
            use ::$curve::elliptic_curve::generic_array::GenericArray;
            use ::$curve::elliptic_curve::sec1::{FromEncodedPoint, ToEncodedPoint};
            use ::$curve::{AffinePoint, EncodedPoint, NonZeroScalar, ProjectivePoint};
            use rand::rngs::OsRng;

            pub(super) fn point_from_jwk(jwk: &EcJwk) -> Result<ProjectivePoint> {
                let x = fixed_width(&b64url_decode(&jwk.x)?, $field_len)?;
                let y = fixed_width(&b64url_decode(&jwk.y)?, $field_len)?;
                let encoded = EncodedPoint::from_affine_coordinates(
                    GenericArray::from_slice(&x),
                    GenericArray::from_slice(&y),
                    false,
                );
                let affine = Option::<AffinePoint>::from(AffinePoint::from_encoded_point(
                    &encoded,
                ))
                .context("jwk coordinates are not on the curve")?;
                Ok(ProjectivePoint::from(affine))
            }

            pub(super) fn point_to_jwk(point: &ProjectivePoint) -> Result<EcJwk> {
                let encoded = point.to_affine().to_encoded_point(false);
                let x = encoded.x().context("point at infinity")?;
                let y = encoded.y().context("point at infinity")?;
                Ok(EcJwk {
                    kty: "EC".to_string(),
                    crv: $crv_name.to_string(),
                    x: b64url_encode(x),
                    y: b64url_encode(y),
                    key_ops: None,
                    alg: None,
                })
            }

            pub(super) fn start(
                epk: &EcJwk,
                server_jwk: &EcJwk,
            ) -> Result<(NonZeroScalar, ProjectivePoint, EcJwk)> {
                let stored = point_from_jwk(epk)?;
                let server = point_from_jwk(server_jwk)?;
                let eph = NonZeroScalar::random(&mut OsRng);
                // X = C + [e]G
                let blinded = stored + ProjectivePoint::GENERATOR * *eph;
                Ok((eph, server, point_to_jwk(&blinded)?))
            }

            pub(super) fn finish(
                eph: NonZeroScalar,
                server: ProjectivePoint,
                response: &EcJwk,
            ) -> Result<Vec<u8>> {
                let y = point_from_jwk(response)?;
                // K = Y - [e]S
                let k = y - server * *eph;
                let encoded = k.to_affine().to_encoded_point(false);
                let x = encoded
                    .x()
                    .context("recovered key is the point at infinity")?;
                Ok(x.to_vec())
            }
        }
    };
}

curve_ops!(p256, 32, "P-256");
curve_ops!(p521, 66, "P-521");

impl ExchangeState {
    fn start(epk: &EcJwk, server_jwk: &EcJwk) -> Result<Self> {
        if server_jwk.crv != epk.crv {
            bail!(
                "curve mismatch between epk ({}) and server key ({})",
                epk.crv,
                server_jwk.crv
            );
        }
        match epk.crv.as_str() {
            "P-256" => {
                let (eph, server, blinded) = p256::start(epk, server_jwk)?;
                Ok(ExchangeState {
                    blinded,
                    inner: Exchange::P256 { eph, server },
                })
            }
            "P-521" => {
                let (eph, server, blinded) = p521::start(epk, server_jwk)?;
                Ok(ExchangeState {
                    blinded,
                    inner: Exchange::P521 { eph, server },
                })
            }
            other => bail!("unsupported curve {}", other),
        }
    }

    fn finish(self, response: &EcJwk) -> Result<Vec<u8>> {
        match self.inner {
            Exchange::P256 { eph, server, .. } => p256::finish(eph, server, response),
            Exchange::P521 { eph, server, .. } => p521::finish(eph, server, response),
        }
    }
}

fn fixed_width(bytes: &[u8], width: usize) -> Result<Vec<u8>> {
    if bytes.len() > width {
        bail!("coordinate too long: {} > {}", bytes.len(), width);
    }
    let mut out = vec![0u8; width - bytes.len()];
    out.extend_from_slice(bytes);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jwk_for(scalar: u64) -> (::p256::NonZeroScalar, EcJwk) {
        use ::p256::{ProjectivePoint, Scalar};

        let s = ::p256::NonZeroScalar::new(Scalar::from(scalar)).unwrap();
        let point = ProjectivePoint::GENERATOR * *s;
        (s, p256::point_to_jwk(&point).unwrap())
    }

    #[test]
    fn test_blinded_exchange_recovers_shared_point() {
        // server key pair (s, S) and stored client key pair (c, C)
        let (s, server_jwk) = jwk_for(0x1234_5678);
        let (c, client_jwk) = jwk_for(0x0dead_beef);

        let exchange = ExchangeState::start(&client_jwk, &server_jwk).unwrap();
        let blinded = exchange.blinded.clone();

        // emulate the tang server: Y = [s]X
        let x = p256::point_from_jwk(&blinded).unwrap();
        let y = x * *s;
        let response = p256::point_to_jwk(&y).unwrap();

        let z = exchange.finish(&response).unwrap();

        // ground truth: K = [c]S = [s]C
        let expected = p256::point_from_jwk(&server_jwk).unwrap() * *c;
        let expected_jwk = p256::point_to_jwk(&expected).unwrap();
        assert_eq!(b64url_encode(&z), expected_jwk.x);
        assert_eq!(z.len(), 32);

        // and the blinded point is NOT the stored point
        assert_ne!(client_jwk.x, blinded.x);
    }

    #[test]
    fn test_select_exchange_key_prefers_kid() {
        let (_, key_a) = jwk_for(1111);
        let (_, key_b) = jwk_for(2222);
        let mut key_a = key_a;
        let mut key_b = key_b;
        key_a.key_ops = Some(vec!["deriveKey".to_string()]);
        key_b.key_ops = Some(vec!["deriveKey".to_string()]);

        let payload = serde_json::json!({ "keys": [key_a, key_b.clone()] });
        let adv = serde_json::json!({
            "payload": b64url_encode(payload.to_string().as_bytes()),
            "protected": "e30",
            "signature": ""
        });

        let kid = key_b.thumbprint();
        let selected = select_exchange_key(&adv, "P-256", Some(&kid)).unwrap();
        assert_eq!(selected.x, key_b.x);

        // verify keys must never be chosen
        let verify_only = serde_json::json!({ "keys": [ {
            "kty": "EC", "crv": "P-256", "x": key_b.x, "y": key_b.y,
            "key_ops": ["verify"]
        } ] });
        let adv2 = serde_json::json!({
            "payload": b64url_encode(verify_only.to_string().as_bytes()),
        });
        assert!(select_exchange_key(&adv2, "P-256", None).is_err());
    }

    #[test]
    fn test_curve_mismatch_rejected() {
        let (_, a) = jwk_for(1);
        let mut b = a.clone();
        b.crv = "P-521".to_string();
        assert!(ExchangeState::start(&a, &b).is_err());
    }
}
