use crossterm::{
    cursor, queue,
    style::{Color, Print, ResetColor, SetBackgroundColor, SetForegroundColor},
};
use std::fmt::Write as _;
use std::io::{self, Write};

use splatflow::math::Mat4;
use splatflow::SplatDataStore;

use super::Viewer;

const POINT: char = '\u{2022}';
const MAX_PREVIEW_POINTS: usize = 40_000;

pub fn rgb_to_ansi256(r: u8, g: u8, b: u8) -> u8 {
    if r == g && g == b {
        if r < 8 {
            return 16;
        }
        if r > 248 {
            return 231;
        }
        return 232 + ((r as f32 - 8.0) / 247.0 * 24.0) as u8;
    }
    let ri = (r as f32 / 255.0 * 5.0 + 0.5) as u8;
    let gi = (g as f32 / 255.0 * 5.0 + 0.5) as u8;
    let bi = (b as f32 / 255.0 * 5.0 + 0.5) as u8;
    16 + 36 * ri + 6 * gi + bi
}

pub fn make_color(r: u8, g: u8, b: u8, use_truecolor: bool) -> Color {
    if use_truecolor {
        Color::Rgb { r, g, b }
    } else {
        Color::AnsiValue(rgb_to_ansi256(r, g, b))
    }
}

fn truncate_and_pad_in_place(text: &mut String, width: usize) {
    if width == 0 {
        text.clear();
        return;
    }

    let mut seen_chars = 0usize;
    let mut truncate_byte = None;
    for (idx, _) in text.char_indices() {
        if seen_chars == width {
            truncate_byte = Some(idx);
            break;
        }
        seen_chars += 1;
    }

    if let Some(idx) = truncate_byte {
        text.truncate(idx);
    } else {
        for _ in seen_chars..width {
            text.push(' ');
        }
    }
}

/// Splat centres in draw order, one cell each; nearer points overwrite
/// farther ones because the order is back to front.
fn rasterize_preview(store: &SplatDataStore, clip: &Mat4, width: usize, height: usize) -> Vec<Option<[u8; 3]>> {
    let mut cells = vec![None; width * height];
    if width == 0 || height == 0 {
        return cells;
    }
    let order = store.order();
    let step = (order.len() / MAX_PREVIEW_POINTS).max(1);
    for &index in order.iter().step_by(step) {
        let Some(splat) = store.splat(index) else {
            continue;
        };
        let p = clip.transform_point4(splat.position);
        if p[3] <= 1e-6 {
            continue;
        }
        let (nx, ny) = (p[0] / p[3], p[1] / p[3]);
        if !(-1.0..=1.0).contains(&nx) || !(-1.0..=1.0).contains(&ny) {
            continue;
        }
        let x = (((nx + 1.0) * 0.5 * width as f32) as usize).min(width - 1);
        let y = (((1.0 - ny) * 0.5 * height as f32) as usize).min(height - 1);
        cells[y * width + x] = Some(splat.color);
    }
    cells
}

fn draw_preview(viewer: &Viewer, cols: u16, rows: u16, stdout: &mut impl Write) -> io::Result<()> {
    let width = cols as usize;
    let height = rows as usize;
    let Some(input) = viewer.last_input else {
        return Ok(());
    };
    let projection = input.projection.unwrap_or(Mat4::IDENTITY);
    let clip = projection.mul_mat(&input.model_view);
    let cells = rasterize_preview(viewer.orchestrator.store(), &clip, width, height);

    let tc = viewer.use_truecolor;
    queue!(stdout, SetBackgroundColor(make_color(0, 0, 0, tc)))?;
    let mut current: Option<[u8; 3]> = None;
    for (y, row) in cells.chunks(width.max(1)).enumerate() {
        queue!(stdout, cursor::MoveTo(0, y as u16))?;
        for cell in row {
            match cell {
                Some(color) => {
                    if current != Some(*color) {
                        queue!(stdout, SetForegroundColor(make_color(color[0], color[1], color[2], tc)))?;
                        current = Some(*color);
                    }
                    queue!(stdout, Print(POINT))?;
                }
                None => queue!(stdout, Print(' '))?,
            }
        }
    }
    Ok(())
}

fn draw_hud(viewer: &mut Viewer, cols: u16, rows: u16, stdout: &mut impl Write) -> io::Result<()> {
    let width = cols as usize;
    let store = viewer.orchestrator.store();
    let stats = viewer.orchestrator.stats();
    let layout = store.layout();
    let hud = &mut viewer.hud_buf;
    hud.clear();
    write!(
        hud,
        "FPS:{:>5.1}  Loaded:{}/{}  Tex:{}x{}  Draw:{}  Sorts:{} ok:{} skip:{} fail:{}  Cull:{}  Cores:{}",
        viewer.fps,
        store.loaded(),
        store.point_count(),
        layout.width,
        layout.height,
        store.draw_count(),
        stats.sorts_issued,
        stats.sorts_applied,
        stats.sorts_skipped,
        stats.sorts_failed,
        if store.frustum_culling() { "on" } else { "off" },
        rayon::current_num_threads()
    )
    .map_err(|_| io::Error::other("failed to format HUD"))?;
    truncate_and_pad_in_place(hud, width);

    let tc = viewer.use_truecolor;
    queue!(
        stdout,
        cursor::MoveTo(0, 0),
        SetBackgroundColor(make_color(0, 0, 0, tc)),
        SetForegroundColor(make_color(245, 245, 245, tc)),
        Print(hud.as_str())
    )?;

    hud.clear();
    match store.bounds() {
        Some(b) => write!(
            hud,
            "Bounds: [{:.2} {:.2} {:.2}] .. [{:.2} {:.2} {:.2}]  Auto-orbit:{}",
            b.min[0],
            b.min[1],
            b.min[2],
            b.max[0],
            b.max[1],
            b.max[2],
            if viewer.auto_orbit { "on" } else { "off" }
        ),
        None => write!(hud, "Bounds: pending  Auto-orbit:{}", if viewer.auto_orbit { "on" } else { "off" }),
    }
    .map_err(|_| io::Error::other("failed to format HUD"))?;
    truncate_and_pad_in_place(hud, width);
    queue!(stdout, cursor::MoveTo(0, 1), Print(hud.as_str()))?;

    hud.clear();
    hud.push_str("Arrows/AD:Orbit  WS/+-:Zoom  Space:Auto-orbit  C:Cull  R:Reframe  Tab:HUD  Q/Esc:Quit");
    truncate_and_pad_in_place(hud, width);
    queue!(
        stdout,
        cursor::MoveTo(0, rows.saturating_sub(1)),
        SetForegroundColor(make_color(220, 220, 220, tc)),
        Print(hud.as_str())
    )?;
    Ok(())
}

pub fn draw(viewer: &mut Viewer, cols: u16, rows: u16, stdout: &mut impl Write) -> io::Result<()> {
    let cols = cols.max(1);
    let rows = rows.max(1);
    draw_preview(viewer, cols, rows, stdout)?;
    if viewer.show_hud {
        draw_hud(viewer, cols, rows, stdout)?;
    }
    queue!(stdout, ResetColor)?;
    stdout.flush()
}
