// Copyright (c) 2026 Embermesh
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//     http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![forbid(unsafe_code)]

//! Generate (or load) an identity bundle and print its public material.
//!
//! Usage: `keygen [data_dir]` - defaults to `./data`. Honors
//! `EMBERMESH_KEY_PASSPHRASE` for key-at-rest encryption.

use anyhow::Result;
use embermesh::core::security::keystore::Keystore;

fn main() -> Result<()> {
    let _ = tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .compact()
        .try_init();

    let data_dir = std::env::args().nth(1).unwrap_or_else(|| "data".to_string());
    let keystore = Keystore::open(&data_dir)?;

    println!("signing_pub:  {}", hex::encode(keystore.signing_public()));
    println!("static_pub:   {}", hex::encode(keystore.static_public()));
    println!("fingerprint:  {}", keystore.fingerprint());
    Ok(())
}
