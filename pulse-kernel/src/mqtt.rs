/**
 * CANAL PUSH MQTT - Updates agents entrants + diffusion des transitions
 *
 * RÔLE :
 * Double du POST /nodes/update pour les agents derrière un broker, et
 * diffusion de chaque événement status_changed aux observateurs abonnés.
 *
 * FONCTIONNEMENT :
 * - Listener : souscrit update@v1, passe chaque payload au pipeline
 *   d'ingestion partagé avec HTTP ; rejets loggés, jamais fatals
 * - Publisher : tâche dédiée abonnée au broadcaster, publie chaque
 *   transition sur status_changed@v1 ; un lag saute les événements perdus
 * - Erreurs broker : backoff 2s puis reprise, le kernel ne tombe jamais
 *   faute de broker
 */

use crate::config::MqttConf;
use crate::fanout::Broadcaster;
use crate::ingest::Ingestor;
use crate::models::{CoreError, UpdateIn};
use rumqttc::{AsyncClient, Event, MqttOptions, QoS};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task;

pub const UPDATE_TOPIC: &str = "pulse/nodes/update@v1";
pub const STATUS_TOPIC: &str = "pulse/nodes/status_changed@v1";

pub fn spawn_update_listener(ingestor: Arc<Ingestor>, conf: MqttConf) {
    task::spawn(async move {
        let mut opts = MqttOptions::new("pulse-kernel", &conf.host, conf.port);
        opts.set_keep_alive(std::time::Duration::from_secs(15));
        let (client, mut eventloop) = AsyncClient::new(opts, 10);
        if let Err(e) = client.subscribe(UPDATE_TOPIC, QoS::AtLeastOnce).await {
            eprintln!("[mqtt] subscribe failed: {e:?}");
            return;
        }

        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(rumqttc::Incoming::Publish(p))) if p.topic == UPDATE_TOPIC => {
                    let Ok(txt) = String::from_utf8(p.payload.to_vec()) else { continue };
                    match serde_json::from_str::<UpdateIn>(&txt) {
                        Ok(payload) => match ingestor.apply(payload) {
                            Ok(_) => {}
                            Err(CoreError::NotAllowed(name)) => {
                                eprintln!("[mqtt] update refusé, client non admis: {name}")
                            }
                            Err(e) => eprintln!("[mqtt] update rejeté: {e}"),
                        },
                        Err(_) => eprintln!("[mqtt] update JSON invalide: {txt}"),
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    eprintln!("[mqtt] erreur broker: {e:?}");
                    tokio::time::sleep(std::time::Duration::from_secs(2)).await;
                }
            }
        }
    });
}

pub fn spawn_status_publisher(broadcaster: Broadcaster, conf: MqttConf) {
    task::spawn(async move {
        let mut opts = MqttOptions::new("pulse-kernel-status", &conf.host, conf.port);
        opts.set_keep_alive(std::time::Duration::from_secs(15));
        let (client, mut eventloop) = AsyncClient::new(opts, 10);
        let mut rx = broadcaster.subscribe();

        loop {
            tokio::select! {
                received = rx.recv() => match received {
                    Ok(event) => {
                        if let Ok(payload) = serde_json::to_string(&event) {
                            if let Err(e) = client.publish(STATUS_TOPIC, QoS::AtLeastOnce, false, payload).await {
                                eprintln!("[mqtt] failed to publish status_changed: {e:?}");
                            }
                        }
                    }
                    // publisher distancé : les transitions perdues ne sont pas
                    // rejouées, les observateurs se rafraîchissent par le pull
                    Err(RecvError::Lagged(skipped)) => {
                        eprintln!("[mqtt] status publisher lagged, {skipped} events skipped");
                    }
                    Err(RecvError::Closed) => break,
                },
                polled = eventloop.poll() => match polled {
                    Ok(_) => {}
                    Err(e) => {
                        eprintln!("[mqtt] erreur broker: {e:?}");
                        tokio::time::sleep(std::time::Duration::from_secs(2)).await;
                    }
                }
            }
        }
    });
}
