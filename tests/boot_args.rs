//! End-to-end checks of the boot-argument plumbing: kernel command lines
//! from real setups must produce the right required-device set, mapping
//! names and mount options.

use booster::blkinfo::{read_blk_info, BlkFormat};
use booster::cmdline::{BootArgs, DeviceRef};
use booster::types::BlkUuid;

use anyhow::Result;
use std::io::{Seek, SeekFrom, Write};

#[test]
fn ext4_by_uuid_with_rootflags() -> Result<()> {
    let args = BootArgs::parse(
        "root=UUID=5c92fc66-7315-408b-b652-176dc554d370 rootflags=user_xattr,nobarrier booster.debug",
    )?;

    assert_eq!(
        args.root,
        Some(DeviceRef::Uuid(BlkUuid::parse(
            "5c92fc66-7315-408b-b652-176dc554d370"
        )?))
    );
    assert!(args.debug);
    assert!(args.luks.uuids.is_empty());

    let opts = args.root_mount_options();
    assert_eq!(opts.data_string(), "user_xattr,nobarrier");
    Ok(())
}

#[test]
fn luks_volume_with_interactive_prompt_name() -> Result<()> {
    let args = BootArgs::parse(
        "rd.luks.uuid=639b8fdd-36ba-443e-be3e-e5b335935502 root=UUID=7bbf9363-eb42-4476-8c1c-9f1f4d091385",
    )?;

    assert!(args.luks.wants("639b8fdd-36ba-443e-be3e-e5b335935502"));
    // the prompt derives from this mapping name
    assert_eq!(
        args.luks.mapping_name("639b8fdd-36ba-443e-be3e-e5b335935502"),
        "luks-639b8fdd-36ba-443e-be3e-e5b335935502"
    );
    Ok(())
}

#[test]
fn luks_volume_with_explicit_name_and_discard() -> Result<()> {
    let args = BootArgs::parse(
        "rd.luks.name=f0c89fd5-7e1e-4ecc-b310-8cd650bd5415=cryptroot root=/dev/mapper/cryptroot rd.luks.options=discard",
    )?;

    assert!(args.luks.wants("f0c89fd5-7e1e-4ecc-b310-8cd650bd5415"));
    assert_eq!(
        args.luks.mapping_name("f0c89fd5-7e1e-4ecc-b310-8cd650bd5415"),
        "cryptroot"
    );
    assert_eq!(
        args.root,
        Some(DeviceRef::Path("/dev/mapper/cryptroot".into()))
    );
    assert_eq!(args.luks.options, vec!["discard"]);
    Ok(())
}

#[test]
fn module_params_reach_the_loader() -> Result<()> {
    let args = BootArgs::parse("root=/dev/sda rw vfio-pci.ids=1002:67df,1002:aaf0")?;
    assert_eq!(
        args.module_params.get("vfio_pci").map(String::as_str),
        Some("ids=1002:67df,1002:aaf0")
    );
    Ok(())
}

#[test]
fn probe_classifies_a_disk_image() -> Result<()> {
    // a bare ext4 superblock is all the probe needs
    let mut image = tempfile::NamedTempFile::new()?;
    image.as_file().set_len(8192)?;
    image.seek(SeekFrom::Start(1080))?;
    image.write_all(&[0x53, 0xef])?;
    image.seek(SeekFrom::Start(1128))?;
    image.write_all(&hex::decode("5c92fc667315408bb652176dc554d370").unwrap())?;
    image.seek(SeekFrom::Start(1144))?;
    image.write_all(b"atestlabel12\0")?;
    image.flush()?;

    let info = read_blk_info(image.path())?;
    assert_eq!(info.format, BlkFormat::Ext4);
    assert_eq!(
        info.uuid.unwrap().to_string(),
        "5c92fc66-7315-408b-b652-176dc554d370"
    );
    assert_eq!(info.label.as_deref(), Some("atestlabel12"));

    // and an unformatted drive stays quietly empty
    let blank = tempfile::NamedTempFile::new()?;
    blank.as_file().set_len(4096)?;
    assert_eq!(read_blk_info(blank.path())?.format, BlkFormat::Empty);
    Ok(())
}
