/*
 * Copyright (C) 2024 The Quarks StatefulSet Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::error::Error;
use std::fs;
use std::path::Path;
use std::pin::Pin;

use openssl::pkey::PKey;
use openssl::ssl::{select_next_proto, AlpnError, Ssl, SslAcceptor, SslMethod};
use openssl::x509::X509;
use tokio::net::TcpStream;
use tokio_openssl::SslStream;

use crate::quarks::util::error::{new_error, with_context};

const ALPN_PROTO_LIST: &[u8] = b"\x08http/1.1";

/// TLS acceptor serving the certificate chain and key at the given paths.
pub(super) fn build_tls_acceptor(
    cert_path: &Path,
    key_path: &Path,
) -> Result<SslAcceptor, Box<dyn Error + Send + Sync>> {
    let cert_pem = fs::read(cert_path).map_err(|e| {
        with_context(e, format!("Failed to read certificate {}", cert_path.display()))
    })?;
    let key_pem = fs::read(key_path)
        .map_err(|e| with_context(e, format!("Failed to read private key {}", key_path.display())))?;

    let chain = X509::stack_from_pem(&cert_pem)
        .map_err(|e| with_context(e, "Failed to parse server certificate PEM"))?;
    let (leaf, intermediates) = chain
        .split_first()
        .ok_or_else(|| new_error("Server certificate file contains no certificate"))?;
    let key = PKey::private_key_from_pem(&key_pem)
        .map_err(|e| with_context(e, "Failed to parse server private key PEM"))?;

    let mut builder = SslAcceptor::mozilla_modern(SslMethod::tls())
        .map_err(|e| with_context(e, "Failed to initialize TLS acceptor builder"))?;
    builder
        .set_private_key(&key)
        .map_err(|e| with_context(e, "Failed to attach server private key"))?;
    builder
        .set_certificate(leaf)
        .map_err(|e| with_context(e, "Failed to attach server certificate"))?;
    for intermediate in intermediates {
        builder
            .add_extra_chain_cert(intermediate.clone())
            .map_err(|e| with_context(e, "Failed to attach intermediate certificate"))?;
    }
    builder
        .check_private_key()
        .map_err(|e| with_context(e, "Server certificate and key mismatch"))?;
    builder
        .set_alpn_protos(ALPN_PROTO_LIST)
        .map_err(|e| with_context(e, "Failed to configure ALPN protocols"))?;
    builder.set_alpn_select_callback(|_, client| {
        select_next_proto(client, ALPN_PROTO_LIST).ok_or(AlpnError::NOACK)
    });

    Ok(builder.build())
}

pub(super) async fn accept_with_tls(
    acceptor: &SslAcceptor,
    stream: TcpStream,
) -> Result<SslStream<TcpStream>, Box<dyn Error + Send + Sync>> {
    let ssl = Ssl::new(acceptor.context())
        .map_err(|e| with_context(e, "Failed to initialize TLS session"))?;
    let mut tls_stream = SslStream::new(ssl, stream)
        .map_err(|e| with_context(e, "Failed to bind TLS stream to socket"))?;
    Pin::new(&mut tls_stream)
        .accept()
        .await
        .map_err(|e| with_context(e, "TLS handshake failed"))?;
    Ok(tls_stream)
}
