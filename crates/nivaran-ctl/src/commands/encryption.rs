/*
 *  Copyright 2025 Colliery Software
 *
 *  Licensed under the Apache License, Version 2.0 (the "License");
 *  you may not use this file except in compliance with the License.
 *  You may obtain a copy of the License at
 *
 *      http://www.apache.org/licenses/LICENSE-2.0
 *
 *  Unless required by applicable law or agreed to in writing, software
 *  distributed under the License is distributed on an "AS IS" BASIS,
 *  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *  See the License for the specific language governing permissions and
 *  limitations under the License.
 */

//! Field-encryption setup.

use anyhow::{ensure, Result};
use nivaran::crypto::FieldCipher;

/// Generates fresh key material and self-tests an encrypt/decrypt round
/// trip plus the keyed lookup hash before printing the export line.
pub fn setup() -> Result<()> {
    let key = FieldCipher::generate_key();
    let cipher = FieldCipher::from_key(Some(&key))?;

    let sample = "+977-9812345678";
    let stored = cipher.encrypt(sample)?;
    let recovered = cipher.decrypt(&stored)?;
    ensure!(recovered == sample, "encryption round trip failed");
    ensure!(
        cipher.lookup_hash(sample) == cipher.lookup_hash(sample),
        "lookup hash is not deterministic"
    );

    println!("Generated encryption key (32 bytes, base64):");
    println!("  {}", key);
    println!();
    println!("Add it to the environment of every worker and web process:");
    println!("  export DB_ENCRYPTION_KEY='{}'", key);
    Ok(())
}
