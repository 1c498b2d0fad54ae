use anyhow::Result;
use serde_json::json;
use std::path::PathBuf;

use crate::cow::CowImage;

pub fn cmd_inspect(image: PathBuf, entries: bool, json: bool) -> Result<()> {
    let mut img = CowImage::open(&image)?;
    let header = *img.header();
    let layout = *img.layout();
    let chunks = img.chunks()?;
    let total: usize = chunks.iter().map(|c| c.len()).sum();

    if json {
        let list: Vec<_> = chunks
            .iter()
            .map(|c| {
                let mut v = json!({
                    "seq": c.seq(),
                    "meta_sector": layout.meta_sector(c.seq()),
                    "used": c.len(),
                    "first_key": c.first_key(),
                    "last_key": c.last_key(),
                });
                if entries {
                    v["entries"] = json!(c.entries());
                }
                v
            })
            .collect();
        let doc = json!({
            "image": image,
            "magic": format!("0x{:08x}", header.magic),
            "version": header.version,
            "sector_size": layout.sector_size(),
            "capacity": layout.capacity(),
            "image_bytes": img.len_bytes(),
            "exceptions": total,
            "chunks": list,
        });
        println!("{}", serde_json::to_string_pretty(&doc)?);
        return Ok(());
    }

    println!("COW image {}", image.display());
    println!("  magic        = 0x{:08x}", header.magic);
    println!("  version      = {}", header.version);
    println!("  sector_size  = {} bytes (x{})", layout.sector_size(), header.sector_multiplier);
    println!("  capacity     = {} entries/chunk", layout.capacity());
    println!("  image_bytes  = {}", img.len_bytes());
    println!("  chunks       = {}", chunks.len());
    println!("  exceptions   = {}", total);
    for c in &chunks {
        println!(
            "  chunk {:>5} @ sector {:>8}: used={:<4} keys {:?}..{:?}",
            c.seq(),
            layout.meta_sector(c.seq()),
            c.len(),
            c.first_key(),
            c.last_key()
        );
        if entries {
            for e in c.entries() {
                println!(
                    "      old_chunk={:<12} new_chunk={:<8} data_sector={}",
                    e.old_chunk,
                    e.new_chunk,
                    layout.data_sector(e.new_chunk)
                );
            }
        }
    }
    Ok(())
}
