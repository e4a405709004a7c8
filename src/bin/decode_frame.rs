#[path = "../error.rs"]
mod error;
#[path = "../crypto.rs"]
mod crypto;

use crypto::Framer;

// Small CLI to help debug self-encrypted HTTP-variant frame captures.
// Usage:
//   cargo run --bin decode_frame -- <psk_base64url> <iv_base64url> <frame_hex>
fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.len() != 3 {
        eprintln!("Usage: decode_frame <psk_base64url> <iv_base64url> <frame_hex>");
        std::process::exit(2);
    }

    let psk = match decode_b64url(&args[0]) {
        Ok(k) => k,
        Err(e) => {
            eprintln!("decode: ERR bad psk: {e}");
            std::process::exit(1);
        }
    };
    let iv_bytes = match decode_b64url(&args[1]) {
        Ok(v) if v.len() == 16 => v,
        Ok(v) => {
            eprintln!("decode: ERR iv must be 16 bytes, got {}", v.len());
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("decode: ERR bad iv: {e}");
            std::process::exit(1);
        }
    };
    let mut iv = [0u8; 16];
    iv.copy_from_slice(&iv_bytes);

    let frame = match hex::decode(args[2].trim()) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("decode: ERR bad hex frame: {e}");
            std::process::exit(1);
        }
    };

    let mut framer = Framer::new(&psk, iv);
    match framer.decrypt(&frame) {
        Ok(plain) => println!("decode: OK  {}", String::from_utf8_lossy(&plain)),
        Err(e) => {
            println!("decode: ERR  {e}");
            std::process::exit(1);
        }
    }
}

fn decode_b64url(s: &str) -> Result<Vec<u8>, base64::DecodeError> {
    use base64::Engine;
    base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(s.trim_end_matches('='))
}
