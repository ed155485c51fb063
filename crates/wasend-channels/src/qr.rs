//! QR code rendering for link codes.

use wasend_core::error::WasendError;

/// Generate a compact QR code for terminal display using Unicode half-block characters.
///
/// Packs two rows of modules into one line of text using `▀`, `▄`, `█`, and space.
pub fn generate_qr_terminal(qr_data: &str) -> Result<String, WasendError> {
    use qrcode::{Color, EcLevel, QrCode};

    let code = QrCode::with_error_correction_level(qr_data.as_bytes(), EcLevel::L)
        .map_err(|e| WasendError::Link(format!("QR generation failed: {e}")))?;

    let width = code.width();
    let colors: Vec<Color> = code.into_colors();
    let is_dark = |row: usize, col: usize| row < width && colors[row * width + col] == Color::Dark;

    let mut out = String::with_capacity((width + 1) * width.div_ceil(2));
    for row in (0..width).step_by(2) {
        for col in 0..width {
            out.push(match (is_dark(row, col), is_dark(row + 1, col)) {
                (true, true) => '█',
                (true, false) => '▀',
                (false, true) => '▄',
                (false, false) => ' ',
            });
        }
        out.push('\n');
    }

    Ok(out)
}

/// Render a QR code as PNG bytes with a white quiet zone.
pub fn generate_qr_image(qr_data: &str) -> Result<Vec<u8>, WasendError> {
    use image::{ImageBuffer, Luma};
    use qrcode::{Color, EcLevel, QrCode};

    let code = QrCode::with_error_correction_level(qr_data.as_bytes(), EcLevel::L)
        .map_err(|e| WasendError::Link(format!("QR generation failed: {e}")))?;

    let module_size: u32 = 8;
    let quiet_zone: u32 = 4;
    let modules = code.width() as u32;
    let img_size = (modules + quiet_zone * 2) * module_size;

    let img = ImageBuffer::from_fn(img_size, img_size, |x, y| {
        let (mx, my) = (x / module_size, y / module_size);
        let inside = (quiet_zone..quiet_zone + modules).contains(&mx)
            && (quiet_zone..quiet_zone + modules).contains(&my);
        if !inside {
            return Luma([255u8]);
        }
        match code[((mx - quiet_zone) as usize, (my - quiet_zone) as usize)] {
            Color::Dark => Luma([0u8]),
            Color::Light => Luma([255u8]),
        }
    });

    let mut buf = std::io::Cursor::new(Vec::new());
    img.write_to(&mut buf, image::ImageFormat::Png)
        .map_err(|e| WasendError::Link(format!("PNG encoding failed: {e}")))?;

    Ok(buf.into_inner())
}
