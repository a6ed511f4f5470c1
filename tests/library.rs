use pmtrace::{
    api::{
        calls::{ApiCall, CallId, CreateInstance},
        handles::ObjectKind,
        result::ReplayResult,
    },
    flags::ReplayFlags,
    pageguard::{decode_package, encode_package, PackageFlags},
    replay::{
        dispatcher::Replayer,
        soft_driver::{DeviceProfile, SoftDriver},
    },
};

#[test]
pub fn packages_built_by_a_host_shim_decode_for_replay() {
    let data = [7u8; 16];
    let bytes = encode_package(&[(0x40, &data[..])], PackageFlags::SPECIAL_FORMAT)
        .unwrap()
        .unwrap();
    let package = decode_package(&bytes).unwrap();
    assert!(package.is_special_format());
    assert_eq!(package.blocks.len(), 1);
    assert_eq!(package.blocks[0].offset, 0x40);
    assert_eq!(package.blocks[0].data, &data[..]);
}

#[test]
pub fn replayer_is_driven_from_outside_the_crate() {
    let mut r = Replayer::new(
        SoftDriver::new(DeviceProfile::default()),
        ReplayFlags::default(),
        None,
    );
    let mut call: ApiCall = CreateInstance {
        application_name: "outside".into(),
        instance: 0x10u64.into(),
        ..Default::default()
    }
    .into();
    let out = r.replay_call(&mut call, &[]);
    assert_eq!(out.result, ReplayResult::Success);
    assert_eq!(r.driver().count(CallId::CreateInstance), 1);
    assert_ne!(r.remapper().remap(ObjectKind::Instance, 0x10), 0);
}
