//! Terminal rendering of pairing codes

use qrcode::QrCode;
use qrcode::QrResult;
use qrcode::render::unicode;

/// Render `code` as a half-block QR image, two modules per character row.
///
/// Colors are inverted so the code scans on a dark terminal.
pub fn render_terminal(code: &str) -> QrResult<String> {
    let qr = QrCode::new(code.as_bytes())?;
    Ok(qr
        .render::<unicode::Dense1x2>()
        .dark_color(unicode::Dense1x2::Light)
        .light_color(unicode::Dense1x2::Dark)
        .build())
}
