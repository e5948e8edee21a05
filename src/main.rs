use log::error;

#[tokio::main]
async fn main() {
    if let Err(e) = booster::run().await {
        // an error here means the boot cannot continue; give the operator
        // a console if the image packs a shell, otherwise panic the kernel
        error!("{:#}", e);
        eprintln!("booster: {:#}", e);
        booster::devmapper::teardown_all();
        booster::console::emergency_shell();
    }
}
