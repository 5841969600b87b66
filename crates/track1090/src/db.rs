/**
 * Static aircraft metadata: registration, type code, description, operator.
 *
 * The database is a `;`-separated gzipped CSV reloaded periodically, e.g.
 * <https://raw.githubusercontent.com/wiedehopf/tar1090-db/csv/aircraft.csv.gz>.
 *
 * Reloads are two-phased: [`DbStore::update`] parses the file into a staging
 * generation without touching the live one, [`DbStore::finish_update`] swaps
 * the staging generation in. Generations are `Arc`s, so a reader holding a
 * clone keeps one consistent view for as long as it likes; any failure
 * during the update leaves the live generation untouched.
 */
use crate::aircraft::Aircraft;
use crate::config::Config;
use crate::message::NON_ICAO_ADDRESS;
use flate2::read::GzDecoder;
use serde_json::{json, Map, Value};
use std::fs::File;
use std::io::Read;
use std::sync::Arc;
use std::time::SystemTime;

type Result<T> =
    std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;

pub const DB_HASH_BITS: u32 = 16;
pub const DB_BUCKETS: usize = 1 << DB_HASH_BITS;

const NONE: u32 = u32::MAX;

const REGISTRATION_LEN: usize = 12;
const TYPE_CODE_LEN: usize = 4;
const TYPE_LONG_LEN: usize = 63;
const YEAR_LEN: usize = 4;
const OWN_OP_LEN: usize = 32;

fn db_hash(addr: u32) -> u32 {
    crate::directory::addr_hash(addr, DB_HASH_BITS)
}

#[derive(Debug, Default, Clone)]
pub struct DbEntry {
    /// ICAO address, with [`NON_ICAO_ADDRESS`] set for `~`-prefixed rows
    pub addr: u32,
    pub registration: String,
    pub type_code: String,
    pub type_long: String,
    pub year: String,
    pub own_op: String,
    pub db_flags: u8,
    next: u32,
}

/// One immutable generation of the database.
#[derive(Debug, Default)]
pub struct AircraftDb {
    entries: Vec<DbEntry>,
    index: Vec<u32>,
}

impl AircraftDb {
    pub fn get(&self, addr: u32) -> Option<&DbEntry> {
        let mut slot = *self.index.get(db_hash(addr) as usize)?;
        while slot != NONE {
            let d = &self.entries[slot as usize];
            if d.addr == addr {
                return Some(d);
            }
            slot = d.next;
        }
        None
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn parse(payload: &[u8]) -> AircraftDb {
        let mut entries = Vec::new();
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(b';')
            .has_headers(false)
            .flexible(true)
            .quoting(false)
            .from_reader(payload);

        for record in reader.byte_records() {
            let Ok(record) = record else { continue };
            let Some(addr_field) = record.get(0) else {
                continue;
            };

            let (addr_hex, flag) = match addr_field.strip_prefix(b"~") {
                Some(rest) => (rest, NON_ICAO_ADDRESS),
                None => (addr_field, 0),
            };
            let Ok(addr_hex) = std::str::from_utf8(addr_hex) else {
                continue;
            };
            let Ok(addr) = u32::from_str_radix(addr_hex.trim(), 16) else {
                continue;
            };
            if addr == 0 {
                continue;
            }

            let field = |i: usize| record.get(i).unwrap_or(b"");
            let mut db_flags = 0u8;
            for (j, &c) in field(3).iter().take(8).enumerate() {
                db_flags |= u8::from(c == b'1') << j;
            }

            entries.push(DbEntry {
                addr: addr | flag,
                registration: sanitize(field(1), REGISTRATION_LEN),
                type_code: sanitize(field(2), TYPE_CODE_LEN),
                db_flags,
                type_long: sanitize(field(4), TYPE_LONG_LEN),
                year: sanitize(field(5), YEAR_LEN),
                own_op: sanitize(field(6), OWN_OP_LEN),
                next: NONE,
            });
        }

        let mut index = vec![NONE; DB_BUCKETS];
        for (i, entry) in entries.iter_mut().enumerate() {
            let bucket = db_hash(entry.addr) as usize;
            entry.next = index[bucket];
            index[bucket] = i as u32;
        }
        AircraftDb { entries, index }
    }

    /// The db.json projection: one object per airframe, empty rows marked
    /// `noRegData`.
    pub fn to_json(&self) -> Value {
        let mut map = Map::new();
        for d in &self.entries {
            let key = format!(
                "{}{:06x}",
                if d.addr & NON_ICAO_ADDRESS != 0 { "~" } else { "" },
                d.addr & 0xff_ffff
            );
            let mut obj = Map::new();
            if !d.registration.is_empty() {
                obj.insert("r".into(), json!(d.registration));
            }
            if !d.type_code.is_empty() {
                obj.insert("t".into(), json!(d.type_code));
            }
            if !d.type_long.is_empty() {
                obj.insert("desc".into(), json!(d.type_long));
            }
            if d.db_flags != 0 {
                obj.insert("dbFlags".into(), json!(d.db_flags));
            }
            if !d.own_op.is_empty() {
                obj.insert("ownOp".into(), json!(d.own_op));
            }
            if !d.year.is_empty() {
                obj.insert("year".into(), json!(d.year));
            }
            if obj.is_empty() {
                obj.insert("noRegData".into(), json!(true));
            }
            map.insert(key, Value::Object(obj));
        }
        Value::Object(map)
    }
}

/**
 * Make a CSV field presentable: cap its length, drop a truncated UTF-8
 * sequence at the tail (never valid multi-byte text), turn double quotes
 * into single ones and control bytes into spaces, and strip a trailing
 * backslash.
 */
fn sanitize(bytes: &[u8], cap: usize) -> String {
    let bytes = &bytes[..bytes.len().min(cap)];
    let valid = match std::str::from_utf8(bytes) {
        Ok(s) => s,
        Err(e) if e.error_len().is_none() => {
            // multi-byte sequence cut short by the cap
            match std::str::from_utf8(&bytes[..e.valid_up_to()]) {
                Ok(s) => s,
                Err(_) => "",
            }
        }
        Err(_) => return String::from_utf8_lossy(bytes).into_owned(),
    };
    let mut s: String = valid
        .chars()
        .map(|c| match c {
            '"' => '\'',
            '\u{1}'..='\u{1e}' => ' ',
            c => c,
        })
        .collect();
    if s.ends_with('\\') {
        s.pop();
    }
    s
}

/// The live/staging generation pair.
#[derive(Debug, Default)]
pub struct DbStore {
    live: Option<Arc<AircraftDb>>,
    staging: Option<Arc<AircraftDb>>,
    modification_time: Option<SystemTime>,
}

impl DbStore {
    /**
     * Build a staging generation from the configured file. Returns whether
     * a staging generation is ready; every failure path leaves the live
     * generation alone and reports one diagnostic line.
     */
    pub fn update(&mut self, config: &Config) -> Result<bool> {
        let Some(path) = &config.db_file else {
            return Ok(false);
        };
        if path.as_os_str().is_empty() || path.as_os_str() == "none" {
            return Ok(false);
        }

        let file = match File::open(path) {
            Ok(file) => file,
            Err(e) => {
                tracing::warn!(?path, error = %e, "db update: open failed");
                return Ok(false);
            }
        };
        let modified = file.metadata()?.modified()?;
        if self.modification_time == Some(modified) {
            return Ok(false);
        }

        let mut payload = Vec::new();
        if let Err(e) = GzDecoder::new(file).read_to_end(&mut payload) {
            tracing::warn!(?path, error = %e, "db update: gunzip failed");
            return Ok(false);
        }
        if payload.len() < 1000 {
            tracing::warn!(?path, "db update: file very small, bailing out");
            return Ok(false);
        }

        let db = AircraftDb::parse(&payload);
        if db.is_empty() {
            tracing::warn!(?path, "db update: no entries, old format?");
            return Ok(false);
        }

        self.modification_time = Some(modified);
        self.staging = Some(Arc::new(db));
        Ok(true)
    }

    /// Swap the staging generation in. The caller re-attaches metadata to
    /// the aircraft it tracks.
    pub fn finish_update(&mut self) -> bool {
        match self.staging.take() {
            Some(db) => {
                let count = db.len();
                self.live = Some(db);
                tracing::info!(count, "database update done");
                true
            }
            None => false,
        }
    }

    pub fn live(&self) -> Option<&Arc<AircraftDb>> {
        self.live.as_ref()
    }

    pub fn staging(&self) -> Option<&Arc<AircraftDb>> {
        self.staging.as_ref()
    }

    /// Install a generation directly, bypassing the file plumbing.
    pub fn install(&mut self, db: AircraftDb) {
        self.live = Some(Arc::new(db));
    }
}

/// Re-attach (or clear) static metadata on one aircraft, and flag military
/// hex ranges.
pub fn update_type_reg(a: &mut Aircraft, db: Option<&AircraftDb>) {
    match db.and_then(|db| db.get(a.addr)) {
        Some(d) => {
            a.registration = d.registration.clone();
            a.type_code = d.type_code.clone();
            a.type_long = d.type_long.clone();
            a.own_op = d.own_op.clone();
            a.year = d.year.clone();
            a.db_flags = d.db_flags;
        }
        None => {
            a.registration.clear();
            a.type_code.clear();
            a.type_long.clear();
            a.own_op.clear();
            a.year.clear();
            a.db_flags = 0;
        }
    }
    if is_military_range(a.addr) {
        a.db_flags |= 1;
    }
}

#[rustfmt::skip]
fn is_military_range(addr: u32) -> bool {
    let i = addr;
    false
        // us military
        //adf7c8-adf7cf = united states mil_5(uf)
        //adf7d0-adf7df = united states mil_4(uf)
        //adf7e0-adf7ff = united states mil_3(uf)
        //adf800-adffff = united states mil_2(uf)
        //ae0000-afffff = united states mil_1(uf)
        || (0xadf7c8..=0xafffff).contains(&i)

        //010070-01008f = egypt_mil
        || (0x010070..=0x01008f).contains(&i)

        //0a4000-0a4fff = algeria mil(ap)
        || (0x0a4000..=0x0a4fff).contains(&i)

        //33ff00-33ffff = italy mil(iy)
        || (0x33ff00..=0x33ffff).contains(&i)

        //350000-37ffff = spain mil(sp)
        || (0x350000..=0x37ffff).contains(&i)

        //3a8000-3affff = france mil_1(fs)
        || (0x3a8000..=0x3affff).contains(&i)
        //3b0000-3bffff = france mil_2(fs)
        || (0x3b0000..=0x3bffff).contains(&i)

        //3ea000-3ebfff = germany mil_1(df)
        || (0x3ea000..=0x3ebfff).contains(&i)
        //3f4000-3f7fff = germany mil_2(df)
        //3f8000-3fbfff = germany mil_3(df)
        || (0x3f4000..=0x3fbfff).contains(&i)

        //400000-40003f = united kingdom mil_1(ra)
        || (0x400000..=0x40003f).contains(&i)
        //43c000-43cfff = united kingdom mil(ra)
        || (0x43c000..=0x43cfff).contains(&i)

        //444000-446fff = austria mil(aq)
        || (0x444000..=0x446fff).contains(&i)

        //44f000-44ffff = belgium mil(bc)
        || (0x44f000..=0x44ffff).contains(&i)

        //457000-457fff = bulgaria mil(bu)
        || (0x457000..=0x457fff).contains(&i)

        //45f400-45f4ff = denmark mil(dg)
        || (0x45f400..=0x45f4ff).contains(&i)

        //468000-4683ff = greece mil(gc)
        || (0x468000..=0x4683ff).contains(&i)

        //473c00-473c0f = hungary mil(hm)
        || (0x473c00..=0x473c0f).contains(&i)

        //478100-4781ff = norway mil(nn)
        || (0x478100..=0x4781ff).contains(&i)
        //480000-480fff = netherlands mil(nm)
        || (0x480000..=0x480fff).contains(&i)
        //48d800-48d87f = poland mil(po)
        || (0x48d800..=0x48d87f).contains(&i)
        //497c00-497cff = portugal mil(pu)
        || (0x497c00..=0x497cff).contains(&i)
        //498420-49842f = czech republic mil(ct)
        || (0x498420..=0x49842f).contains(&i)

        //4b7000-4b7fff = switzerland mil(su)
        || (0x4b7000..=0x4b7fff).contains(&i)
        //4b8200-4b82ff = turkey mil(tq)
        || (0x4b8200..=0x4b82ff).contains(&i)

        //506f00-506fff = slovenia mil(sj)
        || (0x506f00..=0x506fff).contains(&i)

        //70c070-70c07f = oman mil(on)
        || (0x70c070..=0x70c07f).contains(&i)

        //710258-71025f = saudi arabia mil_1(sx)
        //710260-71027f = saudi arabia mil_2(sx)
        //710280-71028f = saudi arabia mil_3(sx)
        || (0x710258..=0x71028f).contains(&i)
        //710380-71039f = saudi arabia mil_4(sx)
        || (0x710380..=0x71039f).contains(&i)

        //738a00-738aff = israel mil(iz)
        || (0x738a00..=0x738aff).contains(&i)

        //7c822e-7c84ff = australia mil_1(av)
        || (0x7c822e..=0x7c84ff).contains(&i)
        //7c8800-7c8fff = australia mil_7(av)
        || (0x7c8800..=0x7c88ff).contains(&i)
        //7c9000-7c9fff = australia mil_8(av)
        //7ca000-7cbfff = australia mil_9(av)
        || (0x7c9000..=0x7cafff).contains(&i)
        //7d0000-7dffff = australia mil_11(av)
        //7e0000-7fffff = australia mil_12(av)
        || (0x7d0000..=0x7fffff).contains(&i)

        //800200-8002ff = india mil(im)
        || (0x800200..=0x8002ff).contains(&i)

        //c20000-c3ffff = canada mil(cb)
        || (0xc20000..=0xc3ffff).contains(&i)

        //e40000-e41fff = brazil mil(bq)
        || (0xe40000..=0xe41fff).contains(&i)

        //e80600-e806ff = chile mil(cq)
        //|| (0xe80600..=0xe806ff).contains(&i)
        // disabled due to civilian aircraft in hex range
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn gz(data: &[u8]) -> Vec<u8> {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    fn write_db(dir: &tempfile::TempDir, rows: &str) -> std::path::PathBuf {
        // pad so the payload clears the minimum size check
        let mut data = String::from(rows);
        for _ in 0..200 {
            data.push_str("000000;;;;;;\n");
        }
        let path = dir.path().join("aircraft.csv.gz");
        std::fs::write(&path, gz(data.as_bytes())).unwrap();
        path
    }

    #[test]
    fn parse_and_lookup() {
        let db = AircraftDb::parse(
            b"400000;G-ABCD;B738;10;Boeing 737-800;2004;Some Airline\n\
              3c6444;D-ABYC;B748;00;Boeing 747-8;2013;Lufthansa\n\
              ~2e8f01;;GLID;01;Glider;;\n",
        );
        assert_eq!(db.len(), 3);
        let d = db.get(0x400000).unwrap();
        assert_eq!(d.registration, "G-ABCD");
        assert_eq!(d.type_code, "B738");
        assert_eq!(d.type_long, "Boeing 737-800");
        assert_eq!(d.year, "2004");
        assert_eq!(d.own_op, "Some Airline");
        assert_eq!(d.db_flags, 0b01);
        assert_eq!(db.get(0x3c6444).unwrap().db_flags, 0);
        // non-ICAO rows live under the flag bit
        assert!(db.get(0x2e8f01).is_none());
        let d = db.get(0x2e8f01 | NON_ICAO_ADDRESS).unwrap();
        assert_eq!(d.db_flags, 0b10);
        assert!(db.get(0x111111).is_none());
    }

    #[test]
    fn flag_bits_follow_character_positions() {
        let db = AircraftDb::parse(b"4b1234;HB-XYZ;PC24;0011;;;\n");
        assert_eq!(
            db.get(0x4b1234).unwrap().db_flags,
            0b1100,
            "bit j set iff character j is '1'"
        );
    }

    #[test]
    fn sanitize_rules() {
        assert_eq!(sanitize(b"G-ABCD", 12), "G-ABCD");
        // quotes and control characters
        assert_eq!(sanitize(b"a\"b\x01c", 12), "a'b c");
        // trailing backslash
        assert_eq!(sanitize(b"oops\\", 12), "oops");
        // valid multi-byte text is preserved
        assert_eq!(sanitize("Aérospatiale".as_bytes(), 63), "Aérospatiale");
        // a cap cutting through a multi-byte char drops the partial tail
        let s = "Aé"; // 3 bytes: A, 0xC3, 0xA9
        assert_eq!(sanitize(s.as_bytes(), 2), "A");
    }

    #[test]
    fn staging_swap_and_failure_keeps_live() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_db(
            &dir,
            "400000;G-ABCD;B738;;Boeing 737-800;2004;Some Airline\n",
        );
        let config = Config {
            db_file: Some(path.clone()),
            ..Default::default()
        };

        let mut store = DbStore::default();
        assert!(store.update(&config).unwrap());
        assert!(store.live().is_none());
        assert!(store.finish_update());
        let live = store.live().unwrap().clone();
        assert!(live.get(0x400000).is_some());

        // unchanged mtime: no-op
        assert!(!store.update(&config).unwrap());

        // a truncated file is rejected, live stays
        std::fs::write(&path, gz(b"tiny")).unwrap();
        let future = SystemTime::now() + std::time::Duration::from_secs(60);
        let file = File::options().write(true).open(&path).unwrap();
        file.set_modified(future).unwrap();
        assert!(!store.update(&config).unwrap());
        assert!(!store.finish_update());
        assert!(store.live().unwrap().get(0x400000).is_some());

        // the old generation survives for readers that kept a handle
        assert!(live.get(0x400000).is_some());
    }

    #[test]
    fn removed_entry_clears_aircraft_metadata() {
        let mut a = Aircraft::new(0x400000);
        let db1 = AircraftDb::parse(b"400000;G-ABCD;B738;00;;;\n");
        update_type_reg(&mut a, Some(&db1));
        assert_eq!(a.registration, "G-ABCD");
        assert_eq!(a.type_code, "B738");
        // uk mil_1 range
        assert_eq!(a.db_flags, 1);

        let db2 = AircraftDb::parse(b"3c6444;D-ABYC;B748;00;;;\n");
        update_type_reg(&mut a, Some(&db2));
        assert_eq!(a.registration, "");
        assert_eq!(a.type_code, "");
        assert_eq!(a.db_flags, 1);
    }

    #[test]
    fn military_range_boundaries() {
        assert!(!is_military_range(0xadf7c7));
        assert!(is_military_range(0xadf7c8));
        assert!(is_military_range(0xafffff));
        assert!(!is_military_range(0xb00000));
        assert!(is_military_range(0x43c000));
        assert!(is_military_range(0x3f4000));
        assert!(!is_military_range(0x3f0000));
        // chile stays disabled
        assert!(!is_military_range(0xe80600));
        // run of the mill civilian hex
        assert!(!is_military_range(0x3c6444));
    }

    #[test]
    fn db_json_projection() {
        let db = AircraftDb::parse(
            b"400000;G-ABCD;B738;10;;;\n\
              aabbcc;;;;;;\n",
        );
        let json = db.to_json();
        assert_eq!(json["400000"]["r"], "G-ABCD");
        assert_eq!(json["400000"]["t"], "B738");
        assert_eq!(json["400000"]["dbFlags"], 1);
        assert_eq!(json["aabbcc"]["noRegData"], true);
    }
}
