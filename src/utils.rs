//! Utility functions

/// Format byte size in human-readable form
pub fn format_bytes(bytes: usize) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];

    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    if unit_idx == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.2} {}", size, UNITS[unit_idx])
    }
}

/// Storage prefix of one level: `{lattice}/{ratio}/{timeframe}/{channel}`
pub fn level_prefix(lattice_id: &str, ratio: u32, timeframe: u32, channel: &str) -> String {
    format!("{}/{}/{}/{}", lattice_id, ratio, timeframe, channel)
}

/// Path of a level's grid payload
pub fn grid_path(lattice_id: &str, ratio: u32, timeframe: u32, channel: &str) -> String {
    format!("{}/grid.bin", level_prefix(lattice_id, ratio, timeframe, channel))
}

/// Path of a segmentation level's set table, shared by its channels
pub fn set_table_path(lattice_id: &str, ratio: u32, timeframe: u32) -> String {
    format!("{}/{}/{}/set_table.json", lattice_id, ratio, timeframe)
}

/// Path of a quantized level's descriptor, a sibling of the grid
pub fn quantization_path(lattice_id: &str, ratio: u32, timeframe: u32, channel: &str) -> String {
    format!("{}/quantization.json", level_prefix(lattice_id, ratio, timeframe, channel))
}
