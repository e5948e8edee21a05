//! LVM2 activation.
//!
//! Physical volumes carry their volume-group description as text metadata;
//! once every PV a group references has been discovered, each logical
//! volume becomes a linear dm target. Only enabled via `enable_lvm`, and
//! only linear (stripe_count = 1) segments are supported, which covers
//! what the generator produces.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use log::{debug, info, warn};

use crate::devmapper;

const LABEL_SECTOR: u64 = 512;
const MDA_MAGIC: &[u8; 16] = b"\x20LVM2\x20x[5A%r0N*>";

// ---- metadata text format ----

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Str(String),
    Num(i64),
    List(Vec<Value>),
    Section(BTreeMap<String, Value>),
}

impl Value {
    fn section(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Section(map) => Some(map),
            _ => None,
        }
    }

    fn str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    fn num(&self) -> Option<i64> {
        match self {
            Value::Num(n) => Some(*n),
            _ => None,
        }
    }
}

struct Parser<'a> {
    input: &'a [u8],
    pos: usize,
}

/// Parse LVM's config-like text metadata into nested sections.
pub fn parse_metadata_text(text: &str) -> Result<BTreeMap<String, Value>> {
    let mut parser = Parser {
        input: text.as_bytes(),
        pos: 0,
    };
    let map = parser.parse_section_body(true)?;
    Ok(map)
}

impl<'a> Parser<'a> {
    fn skip_noise(&mut self) {
        while self.pos < self.input.len() {
            match self.input[self.pos] {
                b'#' => {
                    while self.pos < self.input.len() && self.input[self.pos] != b'\n' {
                        self.pos += 1;
                    }
                }
                b' ' | b'\t' | b'\r' | b'\n' => self.pos += 1,
                _ => break,
            }
        }
    }

    fn peek(&mut self) -> Option<u8> {
        self.skip_noise();
        self.input.get(self.pos).copied()
    }

    fn parse_section_body(&mut self, top_level: bool) -> Result<BTreeMap<String, Value>> {
        let mut map = BTreeMap::new();
        loop {
            match self.peek() {
                None if top_level => return Ok(map),
                None => bail!("unterminated section"),
                Some(b'}') => {
                    self.pos += 1;
                    return Ok(map);
                }
                Some(_) => {
                    let key = self.parse_ident()?;
                    match self.peek() {
                        Some(b'{') => {
                            self.pos += 1;
                            map.insert(key, Value::Section(self.parse_section_body(false)?));
                        }
                        Some(b'=') => {
                            self.pos += 1;
                            map.insert(key, self.parse_value()?);
                        }
                        other => bail!("expected '{{' or '=' after {:?}, got {:?}", key, other),
                    }
                }
            }
        }
    }

    fn parse_ident(&mut self) -> Result<String> {
        self.skip_noise();
        let start = self.pos;
        while self
            .input
            .get(self.pos)
            .is_some_and(|c| c.is_ascii_alphanumeric() || *c == b'_' || *c == b'.' || *c == b'-')
        {
            self.pos += 1;
        }
        if start == self.pos {
            bail!("expected identifier at byte {}", self.pos);
        }
        Ok(String::from_utf8_lossy(&self.input[start..self.pos]).to_string())
    }

    fn parse_value(&mut self) -> Result<Value> {
        match self.peek().context("unexpected end of metadata")? {
            b'"' => {
                self.pos += 1;
                let start = self.pos;
                while self.input.get(self.pos).is_some_and(|c| *c != b'"') {
                    self.pos += 1;
                }
                let s = String::from_utf8_lossy(&self.input[start..self.pos]).to_string();
                self.pos += 1;
                Ok(Value::Str(s))
            }
            b'[' => {
                self.pos += 1;
                let mut items = Vec::new();
                loop {
                    match self.peek().context("unterminated list")? {
                        b']' => {
                            self.pos += 1;
                            return Ok(Value::List(items));
                        }
                        b',' => self.pos += 1,
                        _ => items.push(self.parse_value()?),
                    }
                }
            }
            c if c == b'-' || c.is_ascii_digit() => {
                let start = self.pos;
                self.pos += 1;
                while self.input.get(self.pos).is_some_and(|c| c.is_ascii_digit()) {
                    self.pos += 1;
                }
                let raw = std::str::from_utf8(&self.input[start..self.pos]).unwrap();
                Ok(Value::Num(raw.parse().context("malformed number")?))
            }
            c => bail!("unexpected byte {:?} in metadata", c as char),
        }
    }
}

// ---- physical volume on-disk structures ----

#[derive(Debug, Clone)]
pub struct PhysicalVolume {
    /// 32-character uuid without dashes
    pub uuid: String,
    pub path: PathBuf,
    pub metadata_text: Option<String>,
}

/// Read the PV label and its current metadata text. Blocking.
pub fn read_pv(path: &Path) -> Result<PhysicalVolume> {
    let mut dev =
        File::open(path).with_context(|| format!("unable to open {}", path.display()))?;

    let mut label = [0u8; 512];
    dev.seek(SeekFrom::Start(LABEL_SECTOR))?;
    dev.read_exact(&mut label).context("unable to read pv label")?;
    if &label[0..8] != b"LABELONE" {
        bail!("{} has no LVM label", path.display());
    }
    let pv_header_offset = u32::from_le_bytes(label[20..24].try_into().unwrap()) as usize;
    if pv_header_offset + 40 > label.len() {
        bail!("implausible pv header offset {}", pv_header_offset);
    }

    let header = &label[pv_header_offset..];
    let uuid = String::from_utf8_lossy(&header[0..32]).to_string();

    let area_at = |pos: usize| -> Result<(u64, u64)> {
        let raw = label
            .get(pos..pos + 16)
            .context("pv header area list runs past the label sector")?;
        Ok((
            u64::from_le_bytes(raw[0..8].try_into().unwrap()),
            u64::from_le_bytes(raw[8..16].try_into().unwrap()),
        ))
    };

    // disk areas: data area list, then metadata area list, each zero-terminated
    let mut pos = pv_header_offset + 40;
    // skip data areas
    loop {
        let (offset, size) = area_at(pos)?;
        pos += 16;
        if offset == 0 && size == 0 {
            break;
        }
    }
    // first metadata area
    let (mda_offset, _) = area_at(pos)?;
    let metadata_text = if mda_offset != 0 {
        read_metadata_text(&mut dev, mda_offset)
            .map_err(|e| debug!("no usable metadata on {}: {:#}", path.display(), e))
            .ok()
    } else {
        None
    };

    Ok(PhysicalVolume {
        uuid,
        path: path.to_path_buf(),
        metadata_text,
    })
}

fn read_metadata_text(dev: &mut File, mda_offset: u64) -> Result<String> {
    let mut mda_header = [0u8; 512];
    dev.seek(SeekFrom::Start(mda_offset))?;
    dev.read_exact(&mut mda_header)
        .context("unable to read mda header")?;
    if &mda_header[4..20] != MDA_MAGIC {
        bail!("mda magic mismatch");
    }

    // first raw location descriptor
    let locn_base = 40;
    let offset = u64::from_le_bytes(mda_header[locn_base..locn_base + 8].try_into().unwrap());
    let size =
        u64::from_le_bytes(mda_header[locn_base + 8..locn_base + 16].try_into().unwrap());
    if size == 0 || size > 16 * 1024 * 1024 {
        bail!("implausible metadata size {}", size);
    }

    let mut text = vec![0u8; size as usize];
    dev.seek(SeekFrom::Start(mda_offset + offset))?;
    dev.read_exact(&mut text).context("unable to read metadata")?;
    let end = text.iter().position(|b| *b == 0).unwrap_or(text.len());
    Ok(String::from_utf8_lossy(&text[..end]).to_string())
}

// ---- volume group model ----

#[derive(Debug, Clone)]
pub struct LvSegment {
    pub start_extent: u64,
    pub extent_count: u64,
    /// (pv key in the vg, starting extent on that pv)
    pub stripe: (String, u64),
}

#[derive(Debug, Clone)]
pub struct LogicalVolume {
    pub name: String,
    pub id: String,
    pub segments: Vec<LvSegment>,
}

#[derive(Debug, Clone)]
pub struct PvRef {
    pub uuid: String,
    pub pe_start: u64,
}

#[derive(Debug, Clone)]
pub struct VolumeGroup {
    pub name: String,
    pub id: String,
    /// in sectors
    pub extent_size: u64,
    pub pvs: BTreeMap<String, PvRef>,
    pub lvs: Vec<LogicalVolume>,
}

pub fn parse_vg(text: &str) -> Result<VolumeGroup> {
    let root = parse_metadata_text(text)?;
    let (vg_name, vg) = root
        .iter()
        .find_map(|(k, v)| v.section().map(|s| (k.clone(), s)))
        .context("metadata has no volume group section")?;

    let id = vg
        .get("id")
        .and_then(Value::str)
        .context("vg has no id")?
        .replace('-', "");
    let extent_size = vg
        .get("extent_size")
        .and_then(Value::num)
        .context("vg has no extent_size")? as u64;

    let mut pvs = BTreeMap::new();
    for (pv_name, pv) in vg
        .get("physical_volumes")
        .and_then(Value::section)
        .context("vg has no physical_volumes")?
    {
        let pv = pv.section().context("malformed pv entry")?;
        pvs.insert(
            pv_name.clone(),
            PvRef {
                uuid: pv
                    .get("id")
                    .and_then(Value::str)
                    .context("pv has no id")?
                    .replace('-', ""),
                pe_start: pv
                    .get("pe_start")
                    .and_then(Value::num)
                    .context("pv has no pe_start")? as u64,
            },
        );
    }

    let mut lvs = Vec::new();
    if let Some(lv_sections) = vg.get("logical_volumes").and_then(Value::section) {
        for (lv_name, lv) in lv_sections {
            let lv = lv.section().context("malformed lv entry")?;
            let lv_id = lv
                .get("id")
                .and_then(Value::str)
                .context("lv has no id")?
                .replace('-', "");

            let mut segments = Vec::new();
            for (key, value) in lv {
                if !key.starts_with("segment") {
                    continue;
                }
                let Some(segment) = value.section() else {
                    continue;
                };
                let segment_type = segment
                    .get("type")
                    .and_then(Value::str)
                    .unwrap_or("striped");
                if segment_type != "striped" {
                    bail!("lv {} uses unsupported segment type {}", lv_name, segment_type);
                }
                let stripe_count = segment
                    .get("stripe_count")
                    .and_then(Value::num)
                    .unwrap_or(1);
                if stripe_count != 1 {
                    bail!("lv {} is striped over {} devices", lv_name, stripe_count);
                }
                let stripes = segment
                    .get("stripes")
                    .and_then(|v| match v {
                        Value::List(items) => Some(items),
                        _ => None,
                    })
                    .context("segment has no stripes")?;
                let (pv_key, pv_extent) = match stripes.as_slice() {
                    [Value::Str(pv), Value::Num(extent)] => (pv.clone(), *extent as u64),
                    _ => bail!("malformed stripes list in lv {}", lv_name),
                };
                segments.push(LvSegment {
                    start_extent: segment
                        .get("start_extent")
                        .and_then(Value::num)
                        .context("segment has no start_extent")?
                        as u64,
                    extent_count: segment
                        .get("extent_count")
                        .and_then(Value::num)
                        .context("segment has no extent_count")?
                        as u64,
                    stripe: (pv_key, pv_extent),
                });
            }
            segments.sort_by_key(|s| s.start_extent);
            lvs.push(LogicalVolume {
                name: lv_name.clone(),
                id: lv_id,
                segments,
            });
        }
    }

    Ok(VolumeGroup {
        name: vg_name,
        id,
        extent_size,
        pvs,
        lvs,
    })
}

/// dm names double every dash in a vg or lv name.
fn dm_escape(name: &str) -> String {
    name.replace('-', "--")
}

// ---- incremental activation ----

#[derive(Default)]
pub struct LvmScanner {
    /// discovered PVs keyed by undashed uuid
    pvs: HashMap<String, PhysicalVolume>,
    activated: HashSet<String>,
}

impl LvmScanner {
    /// Register a freshly probed PV and activate any volume group that is
    /// now complete. Returns the dm nodes of newly activated LVs.
    pub fn pv_discovered(&mut self, pv: PhysicalVolume) -> Vec<PathBuf> {
        debug!("lvm pv {} at {}", pv.uuid, pv.path.display());
        self.pvs.insert(pv.uuid.clone(), pv);

        let mut activated = Vec::new();
        let texts: Vec<String> = self
            .pvs
            .values()
            .filter_map(|pv| pv.metadata_text.clone())
            .collect();
        for text in texts {
            match parse_vg(&text) {
                Ok(vg) => activated.extend(self.try_activate_vg(&vg)),
                Err(e) => warn!("skipping unparseable vg metadata: {:#}", e),
            }
        }
        activated
    }

    fn try_activate_vg(&mut self, vg: &VolumeGroup) -> Vec<PathBuf> {
        // every referenced PV has to be present first
        for pv_ref in vg.pvs.values() {
            if !self.pvs.contains_key(&pv_ref.uuid) {
                debug!("vg {} still waiting for pv {}", vg.name, pv_ref.uuid);
                return Vec::new();
            }
        }

        let mut nodes = Vec::new();
        for lv in &vg.lvs {
            let key = format!("{}/{}", vg.name, lv.name);
            if self.activated.contains(&key) {
                continue;
            }
            match self.activate_lv(vg, lv) {
                Ok(node) => {
                    info!("activated lvm volume {} at {}", key, node.display());
                    self.activated.insert(key);
                    nodes.push(node);
                }
                Err(e) => warn!("unable to activate lvm volume {}: {:#}", key, e),
            }
        }
        nodes
    }

    fn activate_lv(&self, vg: &VolumeGroup, lv: &LogicalVolume) -> Result<PathBuf> {
        let mut table = Vec::new();
        for segment in &lv.segments {
            let (pv_key, pv_extent) = &segment.stripe;
            let pv_ref = vg
                .pvs
                .get(pv_key)
                .ok_or_else(|| anyhow!("segment references unknown pv {}", pv_key))?;
            let pv = self
                .pvs
                .get(&pv_ref.uuid)
                .ok_or_else(|| anyhow!("pv {} disappeared", pv_ref.uuid))?;

            table.push((
                segment.start_extent * vg.extent_size,
                segment.extent_count * vg.extent_size,
                "linear".to_string(),
                format!(
                    "{} {}",
                    pv.path.display(),
                    pv_ref.pe_start + pv_extent * vg.extent_size
                ),
            ));
        }
        if table.is_empty() {
            bail!("lv {} has no segments", lv.name);
        }

        let dm_name = format!("{}-{}", dm_escape(&vg.name), dm_escape(&lv.name));
        let dm_uuid = format!("LVM-{}{}", vg.id, lv.id);
        let node = devmapper::activate(&dm_name, Some(&dm_uuid), &table)?;

        // the /dev/<vg>/<lv> alias lvm tools and fstabs use
        let alias_dir = Path::new("/dev").join(&vg.name);
        std::fs::create_dir_all(&alias_dir)
            .with_context(|| format!("unable to create {}", alias_dir.display()))?;
        let alias = alias_dir.join(&lv.name);
        if !alias.exists() {
            std::os::unix::fs::symlink(&node, &alias)
                .with_context(|| format!("unable to create {}", alias.display()))?;
        }
        Ok(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_METADATA: &str = r#"
booster_test_vg {
id = "Yfj0Xk-3vZw-kKmc-AAAA-BBBB-CCCC-DDDDDD"
seqno = 2
format = "lvm2"
status = ["RESIZEABLE", "READ", "WRITE"]
flags = []
extent_size = 8192
max_lv = 0
max_pv = 0
metadata_copies = 0

physical_volumes {

pv0 {
id = "qo3oXn-Llo1-HcZP-EEEE-FFFF-GGGG-HHHHHH"
device = "/dev/sda"

status = ["ALLOCATABLE"]
flags = []
dev_size = 204800
pe_start = 2048
pe_count = 24
}
}

logical_volumes {

booster_test_lv {
id = "Dw2jzE-Koc2-kAcL-IIII-JJJJ-KKKK-LLLLLL"
status = ["READ", "WRITE", "VISIBLE"]
flags = []
creation_time = 1628000000
segment_count = 1

segment1 {
start_extent = 0
extent_count = 24

type = "striped"
stripe_count = 1	# linear

stripes = [
"pv0", 0
]
}
}
}
}
# Generated by LVM2
"#;

    #[test]
    fn test_parse_metadata_text() {
        let root = parse_metadata_text(SAMPLE_METADATA).unwrap();
        let vg = root["booster_test_vg"].section().unwrap();
        assert_eq!(vg["extent_size"].num(), Some(8192));
        assert_eq!(
            vg["status"],
            Value::List(vec![
                Value::Str("RESIZEABLE".into()),
                Value::Str("READ".into()),
                Value::Str("WRITE".into())
            ])
        );
    }

    #[test]
    fn test_parse_vg() {
        let vg = parse_vg(SAMPLE_METADATA).unwrap();
        assert_eq!(vg.name, "booster_test_vg");
        assert_eq!(vg.extent_size, 8192);
        assert_eq!(vg.id, "Yfj0Xk3vZwkKmcAAAABBBBCCCCDDDDDD");

        let pv = &vg.pvs["pv0"];
        assert_eq!(pv.pe_start, 2048);
        assert_eq!(pv.uuid, "qo3oXnLlo1HcZPEEEEFFFFGGGGHHHHHH");

        assert_eq!(vg.lvs.len(), 1);
        let lv = &vg.lvs[0];
        assert_eq!(lv.name, "booster_test_lv");
        assert_eq!(lv.segments.len(), 1);
        assert_eq!(lv.segments[0].extent_count, 24);
        assert_eq!(lv.segments[0].stripe, ("pv0".to_string(), 0));
    }

    #[test]
    fn test_striped_lv_rejected() {
        let striped = SAMPLE_METADATA.replace("stripe_count = 1\t# linear", "stripe_count = 2");
        assert!(parse_vg(&striped).is_err());
    }

    #[test]
    fn test_vg_waits_for_all_pvs() {
        let mut scanner = LvmScanner::default();
        let nodes = scanner.pv_discovered(PhysicalVolume {
            uuid: "SOMEOTHERUUID".into(),
            path: PathBuf::from("/dev/sdz"),
            metadata_text: Some(SAMPLE_METADATA.to_string()),
        });
        // referenced pv0 uuid is absent, nothing activates
        assert!(nodes.is_empty());
    }

    #[test]
    fn test_dm_escape() {
        assert_eq!(dm_escape("my-vg"), "my--vg");
        assert_eq!(dm_escape("plain"), "plain");
    }
}
