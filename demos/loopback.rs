use revdial::{DialConfig, Listener, PrefaceListener, ReverseDialListener, Role, TcpAcceptor};
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    task::spawn,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let controller = PrefaceListener::new(TcpAcceptor::bind("127.0.0.1:0").await?);
    let controller_addr = controller.local_addr()?;
    controller.register(controller_addr.ip());
    let controller = Arc::new(controller);

    {
        let controller = controller.clone();
        spawn(async move { while controller.accept().await.is_ok() {} });
    }

    let t = {
        spawn(async move {
            let appliance = ReverseDialListener::new(DialConfig::new(controller_addr, Role::Eda));
            loop {
                match appliance.accept().await {
                    Ok((mut s, _)) => {
                        let mut buf = [0; 5];
                        s.read_exact(&mut buf).await?;
                        s.write_all(b"world").await?;
                        return std::io::Result::Ok(());
                    }
                    Err(e) if revdial::is_temporary(&e) => continue,
                    Err(e) => return Err(e),
                }
            }
        })
    };

    let mut s = controller
        .dial_role(controller_addr.ip(), Role::Eda, Duration::from_secs(5))
        .await?;
    s.write_all(b"hello").await?;

    let mut buf = [0; 5];
    s.read_exact(&mut buf).await?;
    println!("{}", String::from_utf8_lossy(&buf));

    t.await??;

    Ok(())
}
