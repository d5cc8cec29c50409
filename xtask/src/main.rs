// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use dualbim::auth::SIGNER_INFO_LEN;
use dualbim::image::{self, ImageBuffer, IMG_SECURITY_SEG_ID};
use p256::ecdsa::{signature::hazmat::PrehashSigner, Signature, SigningKey};
use std::collections::BTreeMap;
use std::fmt::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use zerocopy::AsBytes;

const TARGET: &str = "thumbv7em-none-eabihf";

#[derive(Debug, Parser)]
enum Xtask {
    /// Builds the boot manager for a board and copies out the ELF
    Package {
        #[clap(long)]
        board: String,
        #[clap(long)]
        out: PathBuf,
    },
    /// Fills in the length, signature and CRC of an application image
    Stamp {
        /// Raw application image, header first
        image: PathBuf,
        #[clap(long)]
        out: PathBuf,
        /// File holding the 32-byte P-256 private scalar, big-endian
        #[clap(long)]
        key: Option<PathBuf>,
        /// Signer identifier to record in the image, as 16 hex digits
        #[clap(long, requires = "key")]
        signer_info: Option<String>,
    },
}

// borrowed from hubris
fn remap_paths() -> Result<BTreeMap<PathBuf, &'static str>> {
    // Panic messages in crates have a long prefix; we'll shorten it using
    // the --remap-path-prefix argument to reduce message size.  We'll remap
    // local crates to /dualbim, crates.io to /crates.io, and git
    // dependencies to /git
    let mut remap_paths = BTreeMap::new();

    if let Ok(home) = std::env::var("CARGO_HOME") {
        let cargo_home = PathBuf::from(home);
        remap_paths.insert(cargo_home.join("git").join("checkouts"), "/git");

        let registry = cargo_home.join("registry").join("src");
        remap_paths.insert(registry.join("github.com-1ecc6299db9ec823"), "/crates.io");
        remap_paths.insert(registry.join("index.crates.io-6f17d22bba15001f"), "/crates.io");
    }

    if let Ok(dir) = std::env::var("CARGO_MANIFEST_DIR") {
        let mut root = PathBuf::from(dir);
        root.pop();
        remap_paths.insert(root, "/dualbim");
    }
    Ok(remap_paths)
}

fn package(board: String, out: PathBuf) -> Result<()> {
    let remap_path_prefix = remap_paths()?.iter().fold(String::new(), |mut output, r| {
        let _ = write!(output, " --remap-path-prefix={}={}", r.0.display(), r.1);
        output
    });

    let cargo = std::env::var_os("CARGO").unwrap_or_else(|| "cargo".into());
    let mut command = Command::new(cargo);
    command.arg("build");
    command.arg("--release");
    command.arg("--bin").arg("dualbim");
    command.arg("--target").arg(TARGET);
    command.arg("--no-default-features");
    command.arg("--features");
    command.arg(format!("target-board-{}", board));

    // Setting RUSTFLAGS overrides the target's rustflags in
    // .cargo/config.toml, so the linker script goes here too.
    command.env(
        "RUSTFLAGS",
        format!("{} -C link-arg=-Tlink.x", remap_path_prefix),
    );

    let status = command
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .spawn()?
        .wait()?;

    if !status.success() {
        bail!("build failed: {}", status);
    }

    let elf = PathBuf::from("target")
        .join(TARGET)
        .join("release")
        .join("dualbim");
    std::fs::copy(&elf, &out)
        .with_context(|| format!("copying {} to {}", elf.display(), out.display()))?;
    Ok(())
}

fn parse_signer_info(s: &str) -> Result<[u8; SIGNER_INFO_LEN]> {
    let s = s.trim_start_matches("0x");
    if s.len() != 2 * SIGNER_INFO_LEN {
        bail!("signer info must be {} hex digits", 2 * SIGNER_INFO_LEN);
    }
    let mut out = [0; SIGNER_INFO_LEN];
    for (i, b) in out.iter_mut().enumerate() {
        *b = u8::from_str_radix(&s[2 * i..2 * i + 2], 16)
            .with_context(|| format!("bad signer info {:?}", s))?;
    }
    Ok(out)
}

fn stamp(
    image_path: PathBuf,
    out: PathBuf,
    key: Option<PathBuf>,
    signer_info: Option<String>,
) -> Result<()> {
    let mut img = std::fs::read(&image_path)
        .with_context(|| format!("reading {}", image_path.display()))?;
    let len = u32::try_from(img.len())?;
    if len < image::OAD_IMG_HDR_LEN {
        bail!("{} is too short to hold a header", image_path.display());
    }

    let mut hdr = image::read_header(&ImageBuffer(&img), 0)
        .map_err(|e| anyhow!("reading header: {:?}", e))?;
    if !hdr.has_image_id() {
        bail!("{} does not start with an image header", image_path.display());
    }
    hdr.set_len(len);
    img[..image::OAD_IMG_HDR_LEN as usize].copy_from_slice(hdr.as_bytes());

    if let Some(key) = key {
        let sec = image::find_segment(&ImageBuffer(&img), 0, len, IMG_SECURITY_SEG_ID)
            .map_err(|e| anyhow!("walking segments: {:?}", e))?
            .filter(|&sec| sec + image::SEC_SEG_LEN <= len)
            .ok_or_else(|| anyhow!("image has no room for a signature"))?;

        let scalar = std::fs::read(&key).with_context(|| format!("reading {}", key.display()))?;
        let key = SigningKey::from_slice(&scalar).map_err(|_| anyhow!("bad signing key"))?;

        if let Some(info) = signer_info {
            let at = (sec + image::SEC_SIGNER_INFO_OFFSET) as usize;
            img[at..at + SIGNER_INFO_LEN].copy_from_slice(&parse_signer_info(&info)?);
        }

        let digest = image::signed_digest(&ImageBuffer(&img), 0, len, sec)
            .map_err(|e| anyhow!("hashing image: {:?}", e))?;
        let sig: Signature = key
            .sign_prehash(&digest)
            .map_err(|e| anyhow!("signing: {}", e))?;
        let at = (sec + image::SEC_SIGNATURE_OFFSET) as usize;
        img[at..at + image::SIGNATURE_LEN as usize].copy_from_slice(&sig.to_bytes());
    }

    // The CRC goes last, since it covers the signature.
    let sec = image::find_security_segment(&ImageBuffer(&img), 0, len)
        .map_err(|e| anyhow!("walking segments: {:?}", e))?;
    let crc = image::compute_crc(&ImageBuffer(&img), 0, len, sec)
        .map_err(|e| anyhow!("computing CRC: {:?}", e))?;
    hdr.set_crc32(crc);
    img[..image::OAD_IMG_HDR_LEN as usize].copy_from_slice(hdr.as_bytes());

    std::fs::write(&out, img).with_context(|| format!("writing {}", out.display()))?;
    println!("{}: len {:#x}, crc {:#010x}", out.display(), len, crc);
    Ok(())
}

fn main() -> Result<()> {
    let xtask = Xtask::parse();

    match xtask {
        Xtask::Package { board, out } => {
            package(board, out)?;
        }
        Xtask::Stamp {
            image,
            out,
            key,
            signer_info,
        } => {
            stamp(image, out, key, signer_info)?;
        }
    }
    Ok(())
}
